//! Core library for biddle: tree copy, integrity hashing, catalogs, publish and install.
//! Used by the CLI binary; can be reused by other tools.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod copy;
pub mod descriptor;
pub mod error;
pub mod fetch;
pub mod history;
pub mod install;
pub mod integrity;
pub mod publish;
pub mod status;
pub mod tasks;
pub mod utils;
pub mod version;

// Re-export main API for CLI
pub use archive::{ArchiveTool, TarGzArchiver};
pub use catalog::{CatalogStore, InstalledEntry, ListKind, ListRow, PublishedEntry};
pub use config::{load_rc, Layout, RcConfig};
pub use copy::{copy, CopyCounts};
pub use descriptor::PackageDescriptor;
pub use error::{BiddleError, ErrorSeverity, Result};
pub use fetch::Fetcher;
pub use install::{uninstall, InstallReport, InstallSession};
pub use integrity::{digest_file, digest_str, HashContext};
pub use publish::{unpublish, PublishReport, PublishSession};
pub use status::{status, StatusReport};
pub use tasks::{ShellTaskRunner, TaskOutput, TaskRunner};
pub use utils::{home_dir, init_home, log, log_error};
