//! Test utilities for kegwright
//!
//! - `TestContext` - Wraps TempDir and an Installer rooted in it
//! - Fixture trees - Upstream-shaped unpacked trees with fake programs
//! - Archive and HTTP helpers - Tarballs of fixture trees served by wiremock
//!
//! # Example
//!
//! ```ignore
//! use kw_io::test_utils::{TestContext, fixture_tree, declaration};
//!
//! #[tokio::test]
//! async fn test_install() {
//!     let mut ctx = TestContext::new();
//!     let src = fixture_tree(ctx.path(), "heartbeat");
//!     let spec = declaration("heartbeat", &src, "");
//!     ctx.installer().install(&spec, Default::default()).await.unwrap();
//! }
//! ```

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::digest::tree_digest;
use crate::install::{Installer, create_installer_with_services};
use crate::services::ServiceManager;
use kw_core::PackageSpec;

/// Placeholder left in fixture configs for substitution tests
pub const LOG_DIR_PLACEHOLDER: &str = "PLACEHOLDER_LOG_DIR";

// ============================================================================
// TestContext
// ============================================================================

pub struct TestContext {
    tmp: TempDir,
    installer: Installer,
}

impl TestContext {
    /// Installer with state under `<tmp>/root`, prefix `<tmp>/prefix` and
    /// service files written to `<tmp>/services`.
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let services = ServiceManager::new_with_paths(&tmp.path().join("services"));
        let installer = create_installer_with_services(
            &tmp.path().join("root"),
            &tmp.path().join("prefix"),
            services,
        )
        .expect("failed to create installer");
        Self { tmp, installer }
    }

    pub fn path(&self) -> &Path {
        self.tmp.path()
    }

    pub fn root(&self) -> PathBuf {
        self.tmp.path().join("root")
    }

    pub fn prefix(&self) -> PathBuf {
        self.tmp.path().join("prefix")
    }

    pub fn installer(&mut self) -> &mut Installer {
        &mut self.installer
    }

    pub fn installer_ref(&self) -> &Installer {
        &self.installer
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Write an executable shell script.
pub fn write_script(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create script directory");
    }
    fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("failed to write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .expect("failed to make script executable");
}

/// Create an upstream-shaped tree at `<base>/<name>-src`:
///
/// ```text
/// bin/<name>             fake daemon: writes "up <arg2>" to <arg1>, then sleeps
/// bin/<name>.bat         ignored by wrapper generation
/// config/<name>.yml      contains PLACEHOLDER_LOG_DIR
/// config/jvm.options
/// lib/<name>.jar
/// README.md
/// ```
pub fn fixture_tree(base: &Path, name: &str) -> PathBuf {
    let root = base.join(format!("{name}-src"));
    write_script(
        &root.join("bin").join(name),
        "echo \"up $2\" > \"$1\"\nexec sleep 300",
    );
    fs::write(root.join("bin").join(format!("{name}.bat")), "@echo off\r\n")
        .expect("failed to write bat file");

    let config = root.join("config");
    fs::create_dir_all(&config).expect("failed to create config dir");
    fs::write(
        config.join(format!("{name}.yml")),
        format!("cluster.name: test\n#path.logs: {LOG_DIR_PLACEHOLDER}\n"),
    )
    .expect("failed to write config");
    fs::write(config.join("jvm.options"), "-Xms1g\n-Xmx1g\n").expect("failed to write options");

    fs::create_dir_all(root.join("lib")).expect("failed to create lib dir");
    fs::write(root.join("lib").join(format!("{name}.jar")), [0x50, 0x4b, 0x03, 0x04])
        .expect("failed to write jar");
    fs::write(root.join("README.md"), format!("# {name}\n")).expect("failed to write readme");
    root
}

/// Declaration for a directory source, digest computed from the tree.
///
/// `extra` is spliced into the JSON object after the required fields and
/// must start with a comma when non-empty.
pub fn declaration(name: &str, source: &Path, extra: &str) -> PackageSpec {
    let sha = tree_digest(source).expect("failed to digest fixture");
    declaration_with_sha(name, source, &sha, extra)
}

pub fn declaration_with_sha(name: &str, source: &Path, sha256: &str, extra: &str) -> PackageSpec {
    PackageSpec::from_json(&format!(
        r#"{{
            "name": "{name}",
            "version": "1.0.0",
            "source": {{"path": "{}"}},
            "sha256": "{sha256}"{extra}
        }}"#,
        source.display()
    ))
    .expect("invalid fixture declaration")
}

// ============================================================================
// Archives and HTTP
// ============================================================================

/// Gzipped tarball of `dir` with a single top-level directory `top`.
pub fn tarball(dir: &Path, top: &str) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(top, dir)
        .expect("failed to append fixture to tarball");
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .expect("failed to finish tarball")
}

/// Serve `body` at `route` from a fresh mock server.
pub async fn serve_artifact(route: &str, body: Vec<u8>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;
    server
}
