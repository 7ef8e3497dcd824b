use std::path::{Path, PathBuf};

use pcq_common::ProcessSlot;

/// Directory holding every slot socket of one database's process group.
pub fn group_dir(root: &Path, database_id: u64) -> PathBuf {
    root.join(format!("db-{database_id}"))
}

/// `<group_dir>/slot-<n>.sock`
pub fn socket_path(group_dir: &Path, slot: ProcessSlot) -> PathBuf {
    group_dir.join(format!("slot-{}.sock", slot.0))
}
