//! The install pipeline: fetch, unpack, lay out, describe, bootstrap.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::blob::BlobCache;
use crate::bootstrap::Bootstrapper;
use crate::db::{Database, InstalledPackage};
use crate::fetch::{ArtifactKind, FetchedArtifact, Fetcher};
use crate::fsutil::store_err;
use crate::layout::LayoutInstaller;
use crate::services::ServiceManager;
use crate::sign::platform_signer;
use crate::smoke::{ScenarioReport, SmokeTester};
use crate::store::Store;
use kw_core::{
    Error, InstallLayout, PackageSpec, Prefix, RuntimeState, ServiceDescriptor, caveats,
    service,
};

pub struct Installer {
    fetcher: Fetcher,
    store: Store,
    layout: LayoutInstaller,
    bootstrapper: Bootstrapper,
    smoke: SmokeTester,
    services: ServiceManager,
    db: Database,
}

#[derive(Debug, Clone, Copy)]
pub struct InstallOptions {
    /// Run the runtime bootstrapper after the keg is in place
    pub bootstrap: bool,
    /// Write the service file for packages that declare a service
    pub register_service: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            bootstrap: true,
            register_service: true,
        }
    }
}

/// Everything the install phase produced, handed to later stages.
#[derive(Debug, Clone)]
pub struct InstallResult {
    pub layout: InstallLayout,
    pub artifact: FetchedArtifact,
    pub runtime: Option<RuntimeState>,
    pub service: Option<ServiceDescriptor>,
}

/// Result of a cleanup operation
#[derive(Debug, Default)]
pub struct CleanupResult {
    /// Number of unreferenced store entries removed
    pub store_entries_removed: usize,
    /// Number of unreferenced cached blobs and trees removed
    pub blobs_removed: usize,
    /// Number of stale temp files/directories removed
    pub temp_files_removed: usize,
    /// Number of stale lock files removed
    pub locks_removed: usize,
    /// Total bytes freed
    pub bytes_freed: u64,
}

impl Installer {
    pub fn new(
        fetcher: Fetcher,
        store: Store,
        layout: LayoutInstaller,
        services: ServiceManager,
        db: Database,
    ) -> Self {
        Self {
            fetcher,
            store,
            layout,
            bootstrapper: Bootstrapper::new(),
            smoke: SmokeTester::new(),
            services,
            db,
        }
    }

    pub fn prefix(&self) -> &Prefix {
        self.layout.prefix()
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    /// Fetch, unpack and lay out `spec`, then optionally register its
    /// service and bootstrap its runtime.
    ///
    /// Integrity and layout failures leave no keg behind.
    pub async fn install(
        &mut self,
        spec: &PackageSpec,
        options: InstallOptions,
    ) -> Result<InstallResult, Error> {
        spec.validate()?;
        self.check_conflicts(spec)?;

        let artifact = self.fetcher.fetch(&spec.source, &spec.sha256).await?;
        let unpacked = match artifact.kind {
            ArtifactKind::Tree => artifact.path.clone(),
            ArtifactKind::Blob => match self.store.ensure_entry(&artifact.sha256, &artifact.path) {
                Ok(root) => root,
                Err(e) => {
                    // An archive that does not unpack is not worth keeping
                    let _ = self.fetcher.cache().remove_blob(&artifact.sha256);
                    return Err(e);
                }
            },
        };

        let layout = self.layout.install(&unpacked, spec)?;
        for warning in &layout.warnings {
            warn!(name = %spec.name, "{warning}");
        }

        let service = spec
            .service
            .as_ref()
            .map(|s| service::generate(&layout, s))
            .transpose()?;
        if options.register_service
            && let Some(desc) = &service
        {
            self.services.install(&spec.name, desc)?;
        }

        let tx = self.db.transaction()?;
        tx.record_install(&layout, &artifact.sha256)?;
        tx.commit()?;
        info!(name = %spec.name, version = %spec.version, keg = %layout.keg.display(), "installed");

        let runtime = if options.bootstrap {
            Some(self.bootstrap_layout(&layout, spec)?)
        } else {
            None
        };

        Ok(InstallResult {
            layout,
            artifact,
            runtime,
            service,
        })
    }

    fn check_conflicts(&self, spec: &PackageSpec) -> Result<(), Error> {
        for other in &spec.conflicts_with {
            if self.db.get_installed(other)?.is_some() {
                return Err(Error::Conflict {
                    name: spec.name.clone(),
                    installed: other.clone(),
                });
            }
        }
        Ok(())
    }

    /// Layout recorded for the installed version of `spec`.
    pub fn installed_layout(&self, spec: &PackageSpec) -> Result<InstallLayout, Error> {
        match self.db.get_installed(&spec.name)? {
            Some(pkg) if pkg.version == spec.version => Ok(pkg.layout),
            _ => Err(Error::NotInstalled {
                name: format!("{} {}", spec.name, spec.version),
            }),
        }
    }

    /// Bring the runtime of an installed package into its activated state.
    pub fn bootstrap(&mut self, spec: &PackageSpec) -> Result<RuntimeState, Error> {
        let layout = self.installed_layout(spec)?;
        self.bootstrap_layout(&layout, spec)
    }

    fn bootstrap_layout(
        &mut self,
        layout: &InstallLayout,
        spec: &PackageSpec,
    ) -> Result<RuntimeState, Error> {
        let prior = self
            .db
            .get_runtime(&layout.name, &layout.version)?
            .and_then(|state| state.self_config);
        let state = self.bootstrapper.bootstrap(layout, spec, prior.as_ref())?;
        self.db
            .record_runtime(&layout.name, &layout.version, &state)?;
        Ok(state)
    }

    /// Runtime state recorded by the last bootstrap of the installed version.
    pub fn runtime_state(&self, spec: &PackageSpec) -> Result<Option<RuntimeState>, Error> {
        self.db.get_runtime(&spec.name, &spec.version)
    }

    /// Run the smoke-test scenarios of an installed package.
    pub async fn test(
        &self,
        spec: &PackageSpec,
        only: Option<&str>,
    ) -> Result<Vec<ScenarioReport>, Error> {
        let layout = self.installed_layout(spec)?;
        let state = self.runtime_state(spec)?;
        self.smoke.run(&layout, spec, state.as_ref(), only).await
    }

    pub fn caveats(&self, spec: &PackageSpec) -> Result<String, Error> {
        let layout = self.installed_layout(spec)?;
        let state = self.runtime_state(spec)?;
        Ok(caveats::render(&layout, state.as_ref()))
    }

    /// Descriptor for the declared service, computed from the resolved
    /// layout so it is available before installing.
    pub fn service_descriptor(
        &self,
        spec: &PackageSpec,
    ) -> Result<Option<ServiceDescriptor>, Error> {
        let Some(svc) = &spec.service else {
            return Ok(None);
        };
        let layout = self.layout.resolve(spec)?;
        service::generate(&layout, svc).map(Some)
    }

    pub fn list_installed(&self) -> Result<Vec<InstalledPackage>, Error> {
        self.db.list_installed()
    }

    /// Remove interrupted staging, unpacked trees and cached artifacts
    /// that no installed package refers to.
    pub fn cleanup(&mut self) -> Result<CleanupResult, Error> {
        let mut result = CleanupResult::default();
        let referenced: HashSet<String> = self.db.referenced_digests()?.into_iter().collect();

        let entries = self
            .store
            .list_entries()
            .map_err(|e| store_err("failed to list store entries", e))?;
        for sha256 in entries.iter().filter(|sha| !referenced.contains(*sha)) {
            result.bytes_freed += crate::fsutil::dir_size(&self.store.entry_path(sha256));
            self.store.remove_entry(sha256)?;
            result.store_entries_removed += 1;
        }

        let cache = self.fetcher.cache();
        let (blobs, blob_bytes) = cache
            .remove_blobs_except(&referenced)
            .map_err(|e| store_err("failed to remove blobs", e))?;
        let (trees, tree_bytes) = cache
            .remove_trees_except(&referenced)
            .map_err(|e| store_err("failed to remove cached trees", e))?;
        result.blobs_removed = blobs.len() + trees.len();
        result.bytes_freed += blob_bytes + tree_bytes;

        let (temp_count, temp_bytes) = cache
            .cleanup_temp_files()
            .map_err(|e| store_err("failed to cleanup temp files", e))?;
        result.temp_files_removed += temp_count;
        result.bytes_freed += temp_bytes;

        let (temp_dirs, temp_dir_bytes) = self
            .store
            .cleanup_temp_dirs()
            .map_err(|e| store_err("failed to cleanup temp dirs", e))?;
        result.temp_files_removed += temp_dirs;
        result.bytes_freed += temp_dir_bytes;

        result.temp_files_removed += self
            .layout
            .cleanup_staging()
            .map_err(|e| store_err("failed to cleanup staging kegs", e))?;

        result.locks_removed = self
            .store
            .cleanup_stale_locks()
            .map_err(|e| store_err("failed to cleanup stale locks", e))?;

        Ok(result)
    }
}

/// Open (creating if needed) the state under `root` and build an installer
/// targeting `prefix`.
pub fn create_installer(root: &Path, prefix: &Path) -> Result<Installer, Error> {
    create_installer_with_services(root, prefix, ServiceManager::new())
}

pub fn create_installer_with_services(
    root: &Path,
    prefix: &Path,
    services: ServiceManager,
) -> Result<Installer, Error> {
    for dir in [root, prefix] {
        fs::create_dir_all(dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::StoreCorruption {
                    message: format!(
                        "cannot create directory '{}': permission denied.\n\n\
                         Create it with:\n  sudo mkdir -p {} && sudo chown $USER {}",
                        dir.display(),
                        dir.display(),
                        dir.display()
                    ),
                }
            } else {
                store_err(format!("failed to create directory '{}'", dir.display()), e)
            }
        })?;
    }
    fs::create_dir_all(root.join("db"))
        .map_err(|e| store_err("failed to create db directory", e))?;

    let cache = BlobCache::new(&root.join("cache"))
        .map_err(|e| store_err("failed to create blob cache", e))?;
    let store = Store::new(root).map_err(|e| store_err("failed to create store", e))?;
    let db = Database::open(&root.join("db/kegwright.sqlite3"))?;

    let mut layout = LayoutInstaller::new(Prefix::new(prefix));
    if let Some(signer) = platform_signer() {
        layout = layout.with_signer(signer);
    }

    Ok(Installer::new(
        Fetcher::new(cache),
        store,
        layout,
        services,
        db,
    ))
}
