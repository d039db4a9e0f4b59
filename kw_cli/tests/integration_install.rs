//! Integration tests for the install phase.
//!
//! These tests drive `Installer` end to end through the same entry points the
//! `kw install` command uses:
//!
//! - Artifact verification for directory and HTTP sources
//! - Store selection and substitutions
//! - Failure atomicity (no keg after integrity or layout errors)
//! - Reinstall determinism
//!
//! Run with: `cargo test --test integration_install`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use kw_core::{Error, PackageSpec, SourceRef};
use kw_io::digest::{sha256_reader, tree_digest};
use kw_io::install::InstallOptions;
use kw_io::test_utils::{
    LOG_DIR_PLACEHOLDER, TestContext, declaration, declaration_with_sha, fixture_tree,
    serve_artifact, tarball,
};
use kw_io::{ArtifactKind, BlobCache, Fetcher};

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Entry {
    Dir,
    File(Vec<u8>),
    Link(PathBuf),
}

/// Every entry under `root` keyed by relative path.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Entry> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Entry>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(root).unwrap().to_path_buf();
            let meta = fs::symlink_metadata(&path).unwrap();
            if meta.file_type().is_symlink() {
                out.insert(rel, Entry::Link(fs::read_link(&path).unwrap()));
            } else if meta.is_dir() {
                out.insert(rel, Entry::Dir);
                walk(root, &path, out);
            } else {
                out.insert(rel, Entry::File(fs::read(&path).unwrap()));
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

fn no_bootstrap() -> InstallOptions {
    InstallOptions {
        bootstrap: false,
        register_service: false,
    }
}

// ============================================================================
// Fetch
// ============================================================================

#[tokio::test]
async fn directory_fetch_with_matching_digest_is_byte_identical() {
    let tmp = TempDir::new().unwrap();
    let src = fixture_tree(tmp.path(), "heartbeat");
    let sha = tree_digest(&src).unwrap();

    let fetcher = Fetcher::new(BlobCache::new(&tmp.path().join("cache")).unwrap());
    let artifact = fetcher
        .fetch(&SourceRef::Path(src.clone()), &sha)
        .await
        .unwrap();

    assert_eq!(artifact.kind, ArtifactKind::Tree);
    assert_eq!(artifact.sha256, sha);
    assert!(!artifact.reused);
    assert_eq!(snapshot(&artifact.path), snapshot(&src));

    let again = fetcher.fetch(&SourceRef::Path(src), &sha).await.unwrap();
    assert!(again.reused);
}

#[tokio::test]
async fn mismatched_digest_is_integrity_error_and_creates_no_keg() {
    let mut ctx = TestContext::new();
    let src = fixture_tree(ctx.path(), "heartbeat");
    let spec = declaration_with_sha("heartbeat", &src, &"f".repeat(64), r#", "install": ["bin"]"#);

    let err = ctx
        .installer()
        .install(&spec, no_bootstrap())
        .await
        .unwrap_err();

    match err {
        Error::Integrity {
            expected, actual, ..
        } => {
            assert_eq!(expected, "f".repeat(64));
            assert_eq!(actual, tree_digest(&src).unwrap());
        }
        other => panic!("expected integrity error, got {other:?}"),
    }
    assert!(!ctx.prefix().join("Cellar").exists());
    assert!(!ctx.prefix().join("opt/heartbeat").exists());
}

#[tokio::test]
async fn http_tarball_is_verified_and_unpacked() {
    let mut ctx = TestContext::new();
    let src = fixture_tree(ctx.path(), "heartbeat");
    let body = tarball(&src, "heartbeat-1.0.0");
    let sha = sha256_reader(body.as_slice()).unwrap();
    let server = serve_artifact("/heartbeat-1.0.0.tar.gz", body).await;

    let spec = PackageSpec::from_json(&format!(
        r#"{{
            "name": "heartbeat",
            "version": "1.0.0",
            "source": {{"url": "{}/heartbeat-1.0.0.tar.gz"}},
            "sha256": "{sha}",
            "install": ["bin", "lib"]
        }}"#,
        server.uri()
    ))
    .unwrap();

    let result = ctx.installer().install(&spec, no_bootstrap()).await.unwrap();
    assert_eq!(result.artifact.kind, ArtifactKind::Blob);
    assert_eq!(
        fs::read(result.layout.store.join("lib/heartbeat.jar")).unwrap(),
        fs::read(src.join("lib/heartbeat.jar")).unwrap()
    );
    assert!(ctx.root().join("store").join(&sha).is_dir());
}

// ============================================================================
// Layout
// ============================================================================

#[tokio::test]
async fn selector_and_placeholder_substitution() {
    let mut ctx = TestContext::new();
    let src = fixture_tree(ctx.path(), "heartbeat");
    let spec = declaration(
        "heartbeat",
        &src,
        &format!(
            r#", "install": ["bin/", "config"],
                "substitutions": [{{
                    "file": "config/heartbeat.yml",
                    "pattern": "{LOG_DIR_PLACEHOLDER}",
                    "replacement": "{{logs}}"
                }}]"#
        ),
    );

    let result = ctx.installer().install(&spec, no_bootstrap()).await.unwrap();
    let layout = result.layout;

    assert!(layout.store.join("bin/heartbeat").is_file());
    assert!(!layout.store.join("README.md").exists());
    assert!(!layout.store.join("lib").exists());

    let config = fs::read_to_string(layout.store.join("config/heartbeat.yml")).unwrap();
    assert!(config.contains(&layout.runtime.logs.display().to_string()));
    assert!(!config.contains(LOG_DIR_PLACEHOLDER));

    // Nothing else was rewritten
    assert_eq!(
        fs::read(layout.store.join("config/jvm.options")).unwrap(),
        fs::read(src.join("config/jvm.options")).unwrap()
    );
    assert!(ctx.prefix().join("opt/heartbeat").exists());
}

#[tokio::test]
async fn absent_pattern_is_layout_mismatch_and_leaves_no_keg() {
    let mut ctx = TestContext::new();
    let src = fixture_tree(ctx.path(), "heartbeat");
    let spec = declaration(
        "heartbeat",
        &src,
        r#", "install": ["config"],
            "substitutions": [{
                "file": "config/heartbeat.yml",
                "pattern": "NOT_IN_THE_FILE",
                "replacement": "x"
            }]"#,
    );

    let err = ctx
        .installer()
        .install(&spec, no_bootstrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LayoutMismatch { .. }), "got {err:?}");
    assert!(!ctx.prefix().join("Cellar/heartbeat/1.0.0").exists());
    assert!(ctx.installer().list_installed().unwrap().is_empty());
}

#[tokio::test]
async fn reinstall_produces_identical_keg() {
    let mut ctx = TestContext::new();
    let src = fixture_tree(ctx.path(), "heartbeat");
    let spec = declaration(
        "heartbeat",
        &src,
        r#", "install": ["bin", "config", "lib"],
            "config": {"keep": ["jvm.options"]},
            "wrappers": [{"dir": "bin"}]"#,
    );

    let first = ctx.installer().install(&spec, no_bootstrap()).await.unwrap();
    let before = snapshot(&first.layout.keg);
    let config_before = snapshot(&first.layout.config);

    let second = ctx.installer().install(&spec, no_bootstrap()).await.unwrap();
    assert_eq!(second.layout.keg, first.layout.keg);
    assert_eq!(snapshot(&second.layout.keg), before);
    assert_eq!(snapshot(&second.layout.config), config_before);
    assert_eq!(second.layout.preserved_config, vec!["heartbeat.yml".to_string()]);
    assert_eq!(second.layout.wrappers, vec!["heartbeat".to_string()]);
}

#[tokio::test]
async fn user_config_survives_reinstall() {
    let mut ctx = TestContext::new();
    let src = fixture_tree(ctx.path(), "heartbeat");
    let spec = declaration(
        "heartbeat",
        &src,
        r#", "install": ["config"], "config": {}"#,
    );

    let first = ctx.installer().install(&spec, no_bootstrap()).await.unwrap();
    let user_file = first.layout.config.join("heartbeat.yml");
    fs::write(&user_file, "cluster.name: mine\n").unwrap();

    ctx.installer().install(&spec, no_bootstrap()).await.unwrap();
    assert_eq!(fs::read_to_string(&user_file).unwrap(), "cluster.name: mine\n");
}
