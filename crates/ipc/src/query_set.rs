use pcq_common::QueryId;

/// Compact set of continuous-query ids, stored as a bitmap over 64-bit words.
///
/// Ids are small by construction (bounded by the registry capacity) so the
/// bitmap stays a handful of words.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QuerySet {
    words: Vec<u64>,
}

impl QuerySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(id: QueryId) -> Self {
        let mut s = Self::new();
        s.insert(id);
        s
    }

    pub fn from_words(mut words: Vec<u64>) -> Self {
        while words.last() == Some(&0) {
            words.pop();
        }
        Self { words }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Returns whether the id was newly inserted.
    pub fn insert(&mut self, id: QueryId) -> bool {
        let (word, bit) = Self::position(id);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        let before = self.words[word];
        self.words[word] |= bit;
        before & bit == 0
    }

    pub fn remove(&mut self, id: QueryId) -> bool {
        let (word, bit) = Self::position(id);
        let Some(w) = self.words.get_mut(word) else {
            return false;
        };
        let present = *w & bit != 0;
        *w &= !bit;
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
        present
    }

    pub fn contains(&self, id: QueryId) -> bool {
        let (word, bit) = Self::position(id);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn union_with(&mut self, other: &QuerySet) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst |= *src;
        }
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// Ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = QueryId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, w)| {
            let mut w = *w;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros();
                w &= w - 1;
                Some(QueryId(i as u32 * 64 + bit))
            })
        })
    }

    fn position(id: QueryId) -> (usize, u64) {
        ((id.0 / 64) as usize, 1_u64 << (id.0 % 64))
    }
}

impl FromIterator<QueryId> for QuerySet {
    fn from_iter<I: IntoIterator<Item = QueryId>>(iter: I) -> Self {
        let mut s = Self::new();
        for id in iter {
            s.insert(id);
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_and_iterate_in_order() {
        let mut s: QuerySet = [QueryId(130), QueryId(3), QueryId(64)].into_iter().collect();
        assert_eq!(s.len(), 3);
        assert!(s.contains(QueryId(64)));
        assert!(!s.contains(QueryId(65)));
        assert!(!s.insert(QueryId(3)));
        assert_eq!(
            s.iter().collect::<Vec<_>>(),
            vec![QueryId(3), QueryId(64), QueryId(130)]
        );
        assert!(s.remove(QueryId(130)));
        assert_eq!(s.words().len(), 2);
        assert!(!s.remove(QueryId(999)));
    }

    #[test]
    fn union_and_trailing_zero_words_normalize() {
        let mut a = QuerySet::singleton(QueryId(1));
        a.union_with(&QuerySet::singleton(QueryId(200)));
        assert_eq!(a.len(), 2);
        assert_eq!(QuerySet::from_words(vec![2, 0, 0]), QuerySet::singleton(QueryId(1)));
        assert!(QuerySet::from_words(vec![0]).is_empty());
    }
}
