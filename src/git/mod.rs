mod process;
pub mod storage;

pub use process::{GitService, format_pkt_line_header, run_stateless, spawn_service};
pub use storage::{CommitInfo, FileEntry, RefInfo, RefKind, RepoStorage};
