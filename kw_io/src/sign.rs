//! Ad-hoc re-signing of installed executables.
//!
//! Copying a signed binary into the store invalidates nothing by itself, but
//! rewriting files or paths does, and macOS refuses to run executables whose
//! signature no longer matches. Each declared subtree is re-signed after the
//! layout is built.

use std::path::{Path, PathBuf};
use std::process::Command;

use rayon::prelude::*;
use tracing::{debug, warn};
use walkdir::WalkDir;

use kw_core::{Error, SigningRule};

#[cfg_attr(test, mockall::automock)]
pub trait Signer: Send + Sync {
    fn sign(&self, path: &Path) -> Result<(), String>;
}

/// `codesign -f -s -`, an ad-hoc signature.
pub struct CodesignSigner;

impl Signer for CodesignSigner {
    fn sign(&self, path: &Path) -> Result<(), String> {
        let output = Command::new("codesign")
            .args(["-f", "-s", "-"])
            .arg(path)
            .output()
            .map_err(|e| format!("failed to run codesign: {e}"))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

/// The signer for the current platform, if it needs one.
pub fn platform_signer() -> Option<Box<dyn Signer>> {
    #[cfg(target_os = "macos")]
    {
        Some(Box::new(CodesignSigner))
    }
    #[cfg(not(target_os = "macos"))]
    {
        None
    }
}

/// Sign every regular file under each rule's subtree of `store`.
///
/// Returns warnings for failures under non-required rules. A failure under
/// a required rule, or a required subtree that does not exist, is an error.
pub fn sign_subtrees(
    signer: &dyn Signer,
    store: &Path,
    rules: &[SigningRule],
) -> Result<Vec<String>, Error> {
    let mut warnings = Vec::new();

    for rule in rules {
        let root = store.join(&rule.path);
        if !root.exists() {
            let message = "subtree does not exist".to_string();
            if rule.required {
                return Err(Error::Signing {
                    path: root,
                    message,
                });
            }
            warn!(path = %root.display(), "skipping signing: {message}");
            warnings.push(format!("{}: {message}", rule.path));
            continue;
        }

        let files: Vec<PathBuf> = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        debug!(path = %root.display(), files = files.len(), "signing subtree");

        let failures: Vec<(PathBuf, String)> = files
            .par_iter()
            .filter_map(|file| signer.sign(file).err().map(|e| (file.clone(), e)))
            .collect();

        if let Some((path, message)) = failures.first() {
            if rule.required {
                return Err(Error::Signing {
                    path: path.clone(),
                    message: message.clone(),
                });
            }
            for (path, message) in &failures {
                warn!(path = %path.display(), "signing failed: {message}");
                let rel = path.strip_prefix(store).unwrap_or(path);
                warnings.push(format!("failed to sign {}: {message}", rel.display()));
            }
        }
    }

    Ok(warnings)
}
