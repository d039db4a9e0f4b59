//! Builds the immutable keg for one package version.
//!
//! Everything is assembled in a staging directory next to the final keg and
//! renamed into place only once selection, substitution, config split,
//! wrapper generation and signing have all succeeded. A failure at any step
//! leaves the Cellar exactly as it was.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::fsutil::{copy_path, move_path, remove_path, store_err};
use crate::sign::{Signer, sign_subtrees};
use kw_core::{
    ConfigSplit, Error, InstallLayout, LinkConflictType, PackageSpec, Prefix, Vars, WrapperSpec,
    substitute,
};

pub struct LayoutInstaller {
    prefix: Prefix,
    user: String,
    signer: Option<Box<dyn Signer>>,
}

/// Staging keg and config directory, removed on drop unless committed.
struct Staging {
    keg: PathBuf,
    config: PathBuf,
    committed: bool,
}

impl Staging {
    fn create(rack: &Path, version: &str) -> Result<Self, Error> {
        let pid = std::process::id();
        let staging = Self {
            keg: rack.join(format!(".{version}.tmp.{pid}")),
            config: rack.join(format!(".{version}.config.tmp.{pid}")),
            committed: false,
        };

        // Leftovers from an interrupted install by a process with our pid
        remove_path(&staging.keg).map_err(|e| store_err("failed to clear staging keg", e))?;
        remove_path(&staging.config)
            .map_err(|e| store_err("failed to clear staging config", e))?;

        fs::create_dir_all(staging.keg.join("libexec"))
            .map_err(|e| store_err("failed to create staging keg", e))?;
        fs::create_dir_all(&staging.config)
            .map_err(|e| store_err("failed to create staging config", e))?;
        Ok(staging)
    }

    fn store(&self) -> PathBuf {
        self.keg.join("libexec")
    }

    fn bin(&self) -> PathBuf {
        self.keg.join("bin")
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        let _ = remove_path(&self.config);
        if !self.committed {
            let _ = remove_path(&self.keg);
        }
    }
}

impl LayoutInstaller {
    pub fn new(prefix: Prefix) -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "kegwright".to_string());
        Self {
            prefix,
            user,
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: Box<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Resolve the layout `spec` would get, without building anything.
    pub fn resolve(&self, spec: &PackageSpec) -> Result<InstallLayout, Error> {
        InstallLayout::resolve(spec, &self.prefix, &self.user)
    }

    /// Build the keg for `spec` from an unpacked artifact tree.
    pub fn install(&self, unpacked_root: &Path, spec: &PackageSpec) -> Result<InstallLayout, Error> {
        let mut layout = self.resolve(spec)?;
        let rack = self.prefix.rack(&spec.name);
        fs::create_dir_all(&rack).map_err(|e| store_err("failed to create rack", e))?;

        let mut staging = Staging::create(&rack, &spec.version)?;
        let store = staging.store();
        let vars = layout.vars();

        copy_selected(unpacked_root, spec, &store)?;
        apply_substitutions(&store, &layout, spec, &vars)?;

        if let Some(split) = &spec.config {
            layout.config_entries = split_config(unpacked_root, &store, &staging.config, split)?;
        }

        let mut wrappers = BTreeSet::new();
        for wrapper in &spec.wrappers {
            write_wrappers(&store, &staging.bin(), &layout, wrapper, &vars, &mut wrappers)?;
        }
        layout.wrappers = wrappers.into_iter().collect();

        if !spec.signing.is_empty() {
            match &self.signer {
                Some(signer) => {
                    let warnings = sign_subtrees(signer.as_ref(), &store, &spec.signing)?;
                    layout.warnings.extend(warnings);
                }
                None => debug!(name = %spec.name, "no signer on this platform, skipping"),
            }
        }

        if let Some(conflict) = opt_conflict(&layout.opt) {
            return Err(conflict);
        }
        commit_keg(&staging.keg, &layout.keg)?;
        staging.committed = true;

        layout.preserved_config =
            install_config(&staging.config, &layout.config, &layout.config_entries)?;
        for entry in &layout.preserved_config {
            debug!(entry, "kept existing config entry");
        }
        link_opt(&layout.opt, &layout.keg)?;

        info!(
            name = %layout.name,
            version = %layout.version,
            keg = %layout.keg.display(),
            "installed keg"
        );
        Ok(layout)
    }

    /// Remove staging directories left by interrupted installs.
    /// Returns the number of directories removed.
    pub fn cleanup_staging(&self) -> io::Result<usize> {
        let cellar = self.prefix.cellar();
        if !cellar.exists() {
            return Ok(0);
        }

        let mut count = 0;
        for rack in fs::read_dir(&cellar)? {
            let rack = rack?.path();
            if !rack.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&rack)? {
                let path = entry?.path();
                if let Some(name) = path.file_name().and_then(|n| n.to_str())
                    && name.starts_with('.')
                    && (name.contains(".tmp.") || name.contains(".old."))
                    && remove_path(&path).is_ok()
                {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

fn copy_selected(unpacked_root: &Path, spec: &PackageSpec, store: &Path) -> Result<(), Error> {
    if spec.install.is_empty() {
        debug!(root = %unpacked_root.display(), "installing whole tree");
        return copy_path(unpacked_root, store).map_err(|e| store_err("failed to copy tree", e));
    }

    for selector in &spec.install {
        let src = unpacked_root.join(selector.source());
        if src.symlink_metadata().is_err() {
            return Err(Error::LayoutMismatch {
                path: src,
                message: "selected path does not exist in the artifact".to_string(),
            });
        }
        let dst = store.join(selector.destination());
        copy_path(&src, &dst)
            .map_err(|e| store_err(format!("failed to copy {}", selector.source()), e))?;
        debug!(from = selector.source(), to = selector.destination(), "copied selection");
    }
    Ok(())
}

fn apply_substitutions(
    store: &Path,
    layout: &InstallLayout,
    spec: &PackageSpec,
    vars: &Vars,
) -> Result<(), Error> {
    for rule in &spec.substitutions {
        let staged = store.join(&rule.file);
        let reported = layout.store.join(&rule.file);
        let text = fs::read_to_string(&staged).map_err(|e| Error::LayoutMismatch {
            path: reported.clone(),
            message: format!("cannot read file for substitution: {e}"),
        })?;

        let replacement = vars.expand(&rule.replacement)?;
        let (rewritten, count) = substitute::apply(&reported, &text, rule, &replacement)?;
        fs::write(&staged, rewritten)
            .map_err(|e| store_err(format!("failed to write {}", rule.file), e))?;
        debug!(file = %rule.file, replaced = count, "applied substitution");
    }
    Ok(())
}

/// Move config entries out of the store into `config_staging`.
///
/// Returns the sorted names of the entries destined for the config root.
fn split_config(
    unpacked_root: &Path,
    store: &Path,
    config_staging: &Path,
    split: &ConfigSplit,
) -> Result<Vec<String>, Error> {
    let in_store = if split.source == "." {
        store.to_path_buf()
    } else {
        store.join(&split.source)
    };
    let (source, from_store) = if in_store.is_dir() {
        (in_store, true)
    } else {
        (unpacked_root.join(&split.source), false)
    };
    if !source.is_dir() {
        return Err(Error::LayoutMismatch {
            path: source,
            message: "config source directory not found".to_string(),
        });
    }

    let entries: Vec<String> = if split.include.is_empty() {
        let mut names = Vec::new();
        for entry in fs::read_dir(&source).map_err(|e| store_err("failed to read config", e))? {
            let entry = entry.map_err(|e| store_err("failed to read config", e))?;
            if let Some(name) = entry.file_name().to_str()
                && !split.keep.iter().any(|k| k == name)
            {
                names.push(name.to_string());
            }
        }
        names
    } else {
        let mut names = Vec::new();
        for name in &split.include {
            if source.join(name).symlink_metadata().is_ok() {
                names.push(name.clone());
            } else if split.optional.contains(name) {
                debug!(entry = %name, "optional config entry absent");
            } else {
                return Err(Error::LayoutMismatch {
                    path: source.join(name),
                    message: "declared config entry not found".to_string(),
                });
            }
        }
        names
    };

    for name in &entries {
        let src = source.join(name);
        let dst = config_staging.join(name);
        let moved = if from_store {
            move_path(&src, &dst)
        } else {
            copy_path(&src, &dst)
        };
        moved.map_err(|e| store_err(format!("failed to stage config entry {name}"), e))?;
    }

    if from_store
        && split.source != "."
        && fs::read_dir(&source).is_ok_and(|mut d| d.next().is_none())
    {
        fs::remove_dir(&source).map_err(|e| store_err("failed to remove empty config dir", e))?;
    }

    let mut entries = entries;
    entries.sort();
    Ok(entries)
}

fn write_wrappers(
    store: &Path,
    bin: &Path,
    layout: &InstallLayout,
    wrapper: &WrapperSpec,
    vars: &Vars,
    written: &mut BTreeSet<String>,
) -> Result<(), Error> {
    let dir = store.join(&wrapper.dir);
    let read = fs::read_dir(&dir).map_err(|e| Error::LayoutMismatch {
        path: layout.store.join(&wrapper.dir),
        message: format!("wrapper directory not readable: {e}"),
    })?;

    let mut names = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| store_err("failed to read wrapper dir", e))?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        if name.starts_with('.') || Path::new(&name).extension().is_some() {
            continue;
        }
        if fs::metadata(&path).is_ok_and(|m| m.is_file()) {
            names.push(name);
        }
    }
    names.sort();

    let args = vars.expand_all(&wrapper.args)?;
    let env = vars.expand_map(&wrapper.env)?;
    fs::create_dir_all(bin).map_err(|e| store_err("failed to create bin", e))?;

    for name in names {
        if !written.insert(name.clone()) {
            return Err(Error::LayoutMismatch {
                path: layout.wrapper_path(&name),
                message: "two wrapper directories provide the same program".to_string(),
            });
        }
        let target = layout.store.join(&wrapper.dir).join(&name);
        let script = render_wrapper(&target, &args, &env);
        let path = bin.join(&name);
        fs::write(&path, script).map_err(|e| store_err("failed to write wrapper", e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .map_err(|e| store_err("failed to chmod wrapper", e))?;
        debug!(wrapper = %name, "wrote wrapper");
    }
    Ok(())
}

/// A `#!/bin/sh` script that exports `env` and execs `target` with `args`.
pub fn render_wrapper(target: &Path, args: &[String], env: &BTreeMap<String, String>) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for (key, value) in env {
        script.push_str(&format!("export {key}={}\n", shell_quote(value)));
    }
    script.push_str("exec ");
    script.push_str(&shell_quote(&target.display().to_string()));
    for arg in args {
        script.push(' ');
        script.push_str(&shell_quote(arg));
    }
    script.push_str(" \"$@\"\n");
    script
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn commit_keg(staging: &Path, keg: &Path) -> Result<(), Error> {
    if keg.symlink_metadata().is_err() {
        return fs::rename(staging, keg).map_err(|e| store_err("failed to commit keg", e));
    }

    let old = keg.with_file_name(format!(
        ".{}.old.{}",
        keg.file_name().and_then(|n| n.to_str()).unwrap_or("keg"),
        std::process::id()
    ));
    let _ = remove_path(&old);
    fs::rename(keg, &old).map_err(|e| store_err("failed to move previous keg aside", e))?;

    if let Err(e) = fs::rename(staging, keg) {
        let _ = fs::rename(&old, keg);
        return Err(store_err("failed to commit keg", e));
    }
    if let Err(e) = remove_path(&old) {
        warn!(path = %old.display(), "failed to remove previous keg: {e}");
    }
    debug!(keg = %keg.display(), "replaced previous keg");
    Ok(())
}

/// Copy staged config entries into the config root, never overwriting.
///
/// Returns the entries that already existed and were left untouched.
fn install_config(
    staged: &Path,
    config_root: &Path,
    entries: &[String],
) -> Result<Vec<String>, Error> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }
    fs::create_dir_all(config_root).map_err(|e| store_err("failed to create config root", e))?;

    let mut preserved = Vec::new();
    for name in entries {
        let dst = config_root.join(name);
        if dst.symlink_metadata().is_ok() {
            preserved.push(name.clone());
            continue;
        }
        copy_path(&staged.join(name), &dst)
            .map_err(|e| store_err(format!("failed to install config entry {name}"), e))?;
    }
    Ok(preserved)
}

/// A real file or directory where the `opt` link belongs.
fn opt_conflict(opt: &Path) -> Option<Error> {
    let meta = fs::symlink_metadata(opt).ok()?;
    if meta.file_type().is_symlink() {
        return None;
    }
    Some(Error::LinkConflict {
        path: opt.to_path_buf(),
        existing_type: if meta.is_dir() {
            LinkConflictType::Directory
        } else {
            LinkConflictType::RegularFile
        },
    })
}

/// Point `opt` at `keg`, replacing a symlink but never a real file.
fn link_opt(opt: &Path, keg: &Path) -> Result<(), Error> {
    if let Some(conflict) = opt_conflict(opt) {
        return Err(conflict);
    }
    if fs::read_link(opt).is_ok_and(|t| t == keg) {
        return Ok(());
    }

    let parent = opt.parent().unwrap_or(Path::new("/"));
    fs::create_dir_all(parent).map_err(|e| store_err("failed to create opt", e))?;
    let tmp = parent.join(format!(
        ".{}.link.{}",
        opt.file_name().and_then(|n| n.to_str()).unwrap_or("opt"),
        std::process::id()
    ));
    let _ = fs::remove_file(&tmp);
    symlink(keg, &tmp).map_err(|e| store_err("failed to create opt link", e))?;
    fs::rename(&tmp, opt).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        store_err("failed to replace opt link", e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::tree_digest;
    use crate::sign::MockSigner;
    use tempfile::TempDir;

    const SHA: &str = "ac1949836c64d4d1b1b9273400d5fd3a91bb6964ded67d2947e93324fad94028";

    fn declaration(extra: &str) -> PackageSpec {
        PackageSpec::from_json(&format!(
            r#"{{
                "name": "elasticsearch-full",
                "version": "8.0.0",
                "source": {{ "path": "/unused" }},
                "sha256": "{SHA}"
                {extra}
            }}"#
        ))
        .unwrap()
    }

    fn unpacked(tmp: &TempDir) -> PathBuf {
        let root = tmp.path().join("src/elasticsearch-8.0.0");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("config")).unwrap();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("bin/elasticsearch"), "#!/bin/sh\necho es\n").unwrap();
        fs::set_permissions(
            root.join("bin/elasticsearch"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        fs::write(root.join("bin/elasticsearch-env.bat"), "rem").unwrap();
        fs::write(
            root.join("config/elasticsearch.yml"),
            "#path.data: /path/to/data\n#path.logs: /path/to/logs\n",
        )
        .unwrap();
        fs::write(root.join("config/jvm.options"), "-Xms1g\n").unwrap();
        fs::write(root.join("lib/es.jar"), "jar").unwrap();
        root
    }

    fn installer(tmp: &TempDir) -> LayoutInstaller {
        LayoutInstaller::new(Prefix::new(&tmp.path().join("prefix"))).with_user("ada")
    }

    const FULL: &str = r##",
        "install": ["bin", "config", "lib"],
        "substitutions": [
            { "file": "config/elasticsearch.yml", "pattern": "#path.data: /path/to/data", "replacement": "path.data: {data}" },
            { "file": "config/elasticsearch.yml", "pattern": "#path.logs: /path/to/logs", "replacement": "path.logs: {logs}" }
        ],
        "config": { "source": "config" },
        "wrappers": [{ "dir": "bin", "env": { "ES_PATH_CONF": "{config}" } }]"##;

    #[test]
    fn builds_keg_with_config_split_and_wrappers() {
        let tmp = TempDir::new().unwrap();
        let root = unpacked(&tmp);
        let layout = installer(&tmp).install(&root, &declaration(FULL)).unwrap();

        assert!(layout.store.join("lib/es.jar").is_file());
        assert!(!layout.store.join("config").exists());
        assert_eq!(layout.config_entries, vec!["elasticsearch.yml", "jvm.options"]);

        let yml = fs::read_to_string(layout.config.join("elasticsearch.yml")).unwrap();
        assert!(yml.contains(&format!("path.data: {}", layout.runtime.data.display())));
        assert!(!yml.contains("/path/to/"));

        assert_eq!(layout.wrappers, vec!["elasticsearch"]);
        let wrapper = fs::read_to_string(layout.bin.join("elasticsearch")).unwrap();
        assert!(wrapper.starts_with("#!/bin/sh\n"));
        assert!(wrapper.contains(&format!("export ES_PATH_CONF='{}'", layout.config.display())));
        assert!(wrapper.contains(&format!(
            "exec '{}' \"$@\"",
            layout.store.join("bin/elasticsearch").display()
        )));
        let mode = fs::metadata(layout.bin.join("elasticsearch")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        assert_eq!(fs::read_link(&layout.opt).unwrap(), layout.keg);
    }

    #[test]
    fn reinstall_is_byte_identical_and_keeps_user_config() {
        let tmp = TempDir::new().unwrap();
        let root = unpacked(&tmp);
        let spec = declaration(FULL);
        let installer = installer(&tmp);

        let first = installer.install(&root, &spec).unwrap();
        let digest = tree_digest(&first.keg).unwrap();
        fs::write(first.config.join("jvm.options"), "-Xms4g\n").unwrap();

        let second = installer.install(&root, &spec).unwrap();
        assert_eq!(tree_digest(&second.keg).unwrap(), digest);
        assert_eq!(second.preserved_config, vec!["elasticsearch.yml", "jvm.options"]);
        assert_eq!(
            fs::read_to_string(second.config.join("jvm.options")).unwrap(),
            "-Xms4g\n"
        );
        assert_eq!(installer.cleanup_staging().unwrap(), 0);
    }

    #[test]
    fn missing_selector_is_layout_mismatch_and_leaves_no_keg() {
        let tmp = TempDir::new().unwrap();
        let root = unpacked(&tmp);
        let spec = declaration(r#", "install": ["bin", "modules"]"#);
        let installer = installer(&tmp);

        let err = installer.install(&root, &spec).unwrap_err();
        assert!(matches!(err, Error::LayoutMismatch { .. }));

        let rack = installer.prefix().rack("elasticsearch-full");
        assert_eq!(fs::read_dir(&rack).unwrap().count(), 0);
    }

    #[test]
    fn absent_pattern_aborts_install() {
        let tmp = TempDir::new().unwrap();
        let root = unpacked(&tmp);
        let spec = declaration(
            r#", "substitutions": [{ "file": "config/jvm.options", "pattern": "-Xlog:gc", "replacement": "x" }]"#,
        );

        let err = installer(&tmp).install(&root, &spec).unwrap_err();
        match err {
            Error::LayoutMismatch { path, .. } => assert!(path.ends_with("config/jvm.options")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!tmp.path().join("prefix/Cellar/elasticsearch-full/8.0.0").exists());
        assert!(!tmp.path().join("prefix/opt/elasticsearch-full").exists());
    }

    #[test]
    fn keep_and_optional_entries() {
        let tmp = TempDir::new().unwrap();
        let root = unpacked(&tmp);
        let spec = declaration(
            r#", "config": { "include": ["elasticsearch.yml", "log4j2.properties"], "optional": ["log4j2.properties"], "keep": ["jvm.options"] }"#,
        );

        let layout = installer(&tmp).install(&root, &spec).unwrap();
        assert_eq!(layout.config_entries, vec!["elasticsearch.yml"]);
        assert!(layout.store.join("config/jvm.options").is_file());
        assert!(!layout.store.join("config/elasticsearch.yml").exists());
    }

    #[test]
    fn missing_required_config_entry_fails() {
        let tmp = TempDir::new().unwrap();
        let root = unpacked(&tmp);
        let spec = declaration(r#", "config": { "include": ["log4j2.properties"] }"#);
        let err = installer(&tmp).install(&root, &spec).unwrap_err();
        assert!(matches!(err, Error::LayoutMismatch { .. }));
    }

    #[test]
    fn mapped_selector_renames_into_store() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("hb");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("heartbeat"), "bin").unwrap();
        fs::write(root.join("heartbeat.yml"), "x").unwrap();
        let spec = declaration(
            r#", "install": [{ "from": "heartbeat", "to": "bin/heartbeat" }, "heartbeat.yml"]"#,
        );

        let layout = installer(&tmp).install(&root, &spec).unwrap();
        assert!(layout.store.join("bin/heartbeat").is_file());
        assert!(layout.store.join("heartbeat.yml").is_file());
    }

    #[test]
    fn required_signing_failure_removes_staging() {
        let tmp = TempDir::new().unwrap();
        let root = unpacked(&tmp);
        let mut signer = MockSigner::new();
        signer
            .expect_sign()
            .returning(|_| Err("code object is not signed at all".to_string()));
        let installer = installer(&tmp).with_signer(Box::new(signer));
        let spec = declaration(r#", "install": ["lib"], "signing": [{ "path": "lib" }]"#);

        let err = installer.install(&root, &spec).unwrap_err();
        assert!(matches!(err, Error::Signing { .. }));
        let rack = installer.prefix().rack("elasticsearch-full");
        assert_eq!(fs::read_dir(&rack).unwrap().count(), 0);
    }

    #[test]
    fn optional_signing_failure_is_a_warning() {
        let tmp = TempDir::new().unwrap();
        let root = unpacked(&tmp);
        let mut signer = MockSigner::new();
        signer.expect_sign().returning(|_| Err("denied".to_string()));
        let spec = declaration(
            r#", "install": ["lib"], "signing": [{ "path": "lib", "required": false }]"#,
        );

        let layout = installer(&tmp)
            .with_signer(Box::new(signer))
            .install(&root, &spec)
            .unwrap();
        assert_eq!(layout.warnings.len(), 1);
    }

    #[test]
    fn opt_conflict_with_real_directory() {
        let tmp = TempDir::new().unwrap();
        let root = unpacked(&tmp);
        fs::create_dir_all(tmp.path().join("prefix/opt/elasticsearch-full")).unwrap();

        let err = installer(&tmp)
            .install(&root, &declaration(r#", "install": ["bin"]"#))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::LinkConflict {
                existing_type: LinkConflictType::Directory,
                ..
            }
        ));
        assert!(!tmp.path().join("prefix/Cellar/elasticsearch-full/8.0.0").exists());
    }

    #[test]
    fn wrapper_quotes_arguments() {
        let script = render_wrapper(
            Path::new("/p/libexec/bin/tool"),
            &["--name=it's".to_string()],
            &BTreeMap::new(),
        );
        assert_eq!(
            script,
            "#!/bin/sh\nexec '/p/libexec/bin/tool' '--name=it'\\''s' \"$@\"\n"
        );
    }

    #[test]
    fn cleanup_removes_interrupted_staging() {
        let tmp = TempDir::new().unwrap();
        let installer = installer(&tmp);
        let rack = installer.prefix().rack("heartbeat");
        fs::create_dir_all(rack.join(".7.14.1.tmp.999/libexec")).unwrap();
        fs::create_dir_all(rack.join("7.14.1")).unwrap();

        assert_eq!(installer.cleanup_staging().unwrap(), 1);
        assert!(rack.join("7.14.1").exists());
    }
}
