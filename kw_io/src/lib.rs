pub mod blob;
pub mod bootstrap;
pub mod companion;
pub mod db;
pub mod digest;
pub mod extract;
pub mod fetch;
pub mod fsutil;
pub mod install;
pub mod layout;
pub mod port;
pub mod process;
pub mod services;
pub mod sign;
pub mod smoke;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use blob::BlobCache;
pub use bootstrap::Bootstrapper;
pub use db::{Database, InstalledPackage};
pub use digest::{sha256_file, tree_digest};
pub use extract::{ArchiveFormat, extract_archive};
pub use fetch::{ArtifactKind, FetchedArtifact, Fetcher};
pub use install::{
    CleanupResult, InstallOptions, InstallResult, Installer, create_installer,
    create_installer_with_services,
};
pub use layout::LayoutInstaller;
pub use services::{ServiceInfo, ServiceManager, ServiceStatus, render_launchd, render_systemd};
pub use sign::{Signer, platform_signer};
pub use smoke::{ScenarioOutcome, ScenarioReport, SmokeTester, TestSession};
pub use store::Store;
