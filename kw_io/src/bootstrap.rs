//! Post-install activation: runtime directories, back-reference links and
//! the one-shot security self-configuration.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::fsutil::store_err;
use crate::process::{Captured, run_captured};
use kw_core::{
    CommandSpec, Error, InstallLayout, LinkConflictType, PackageSpec, RuntimeLinkState,
    RuntimeState, SelfConfigOutcome, SelfConfigSpec, Vars,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct Bootstrapper;

impl Bootstrapper {
    pub fn new() -> Self {
        Self
    }

    /// Bring the runtime roots of `layout` into their activated state.
    ///
    /// Safe to run any number of times: existing directories and correct
    /// links are left alone and no user data is removed. When `prior` is the
    /// outcome of an earlier self-configuration of this keg, it is reused
    /// instead of running the tool again.
    pub fn bootstrap(
        &self,
        layout: &InstallLayout,
        spec: &PackageSpec,
        prior: Option<&SelfConfigOutcome>,
    ) -> Result<RuntimeState, Error> {
        let mut directories: Vec<PathBuf> = layout
            .runtime
            .directories()
            .into_iter()
            .map(Path::to_path_buf)
            .collect();
        directories.sort();
        directories.dedup();

        let mut created = Vec::new();
        for dir in &directories {
            if ensure_dir(dir)? {
                created.push(dir.clone());
            }
        }

        let mut links = Vec::new();
        for decl in &spec.runtime.links {
            let Some(target) = layout.link_target(decl.target) else {
                return Err(Error::InvalidPackage {
                    name: layout.name.clone(),
                    message: format!("link '{}' points at an undeclared root", decl.store),
                });
            };
            // The config root only exists once config was split out
            if ensure_dir(target)? {
                created.push(target.to_path_buf());
            }
            let link = layout.store.join(&decl.store);
            ensure_link(&link, target)?;
            links.push(RuntimeLinkState {
                link,
                target: target.to_path_buf(),
            });
        }

        let self_config = match (&spec.self_config, prior) {
            (None, _) => None,
            (Some(_), Some(prior)) => {
                debug!(name = %layout.name, outcome = prior.label(), "reusing self-configuration outcome");
                Some(prior.clone())
            }
            (Some(sc), None) => Some(self.self_configure(layout, sc)),
        };

        info!(
            name = %layout.name,
            instance = %layout.instance,
            created = created.len(),
            "bootstrapped runtime"
        );
        Ok(RuntimeState {
            instance: layout.instance.clone(),
            directories,
            created,
            links,
            self_config,
        })
    }

    /// Run the self-configuration tool and classify its result.
    ///
    /// Never fails: an unusable tool is reported as `Failed`.
    pub fn self_configure(&self, layout: &InstallLayout, spec: &SelfConfigSpec) -> SelfConfigOutcome {
        let vars = layout.vars();
        let timeout = Duration::from_secs(spec.timeout_secs);

        let run = |program: &str,
                   args: &[String],
                   env: &BTreeMap<String, String>|
         -> Result<Captured, String> {
            let command = build_command(layout, &vars, program, args, env)?;
            run_captured(command, timeout).map_err(|e| format!("failed to run {program}: {e}"))
        };

        let outcome = match run(&spec.program, spec.args.as_slice(), &spec.env) {
            Err(message) => SelfConfigOutcome::Failed {
                exit_code: None,
                output: message,
            },
            Ok(out) if out.timed_out => SelfConfigOutcome::Failed {
                exit_code: None,
                output: format!("timed out after {}s\n{}", spec.timeout_secs, out.combined()),
            },
            Ok(out) if out.success() => match &spec.credential {
                None => SelfConfigOutcome::Configured { credential: None },
                Some(step) => capture_credential(step, &run),
            },
            Ok(out) if out.code() == Some(spec.already_configured_exit_code) => {
                SelfConfigOutcome::AlreadyConfigured
            }
            Ok(out) => SelfConfigOutcome::Failed {
                exit_code: out.code(),
                output: out.combined(),
            },
        };

        match &outcome {
            SelfConfigOutcome::Failed { exit_code, .. } => {
                warn!(name = %layout.name, ?exit_code, "security self-configuration failed")
            }
            other => info!(name = %layout.name, outcome = other.label(), "self-configuration finished"),
        }
        outcome
    }
}

fn capture_credential<F>(step: &CommandSpec, run: &F) -> SelfConfigOutcome
where
    F: Fn(&str, &[String], &BTreeMap<String, String>) -> Result<Captured, String>,
{
    match run(&step.program, step.args.as_slice(), &step.env) {
        Err(message) => SelfConfigOutcome::Failed {
            exit_code: None,
            output: message,
        },
        Ok(out) if !out.success() => SelfConfigOutcome::Failed {
            exit_code: out.code(),
            output: out.combined(),
        },
        Ok(out) => {
            let credential = out.stdout.trim();
            if credential.is_empty() {
                SelfConfigOutcome::Failed {
                    exit_code: out.code(),
                    output: "credential step printed nothing".to_string(),
                }
            } else {
                SelfConfigOutcome::Configured {
                    credential: Some(credential.to_string()),
                }
            }
        }
    }
}

fn build_command(
    layout: &InstallLayout,
    vars: &Vars,
    program: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> Result<Command, String> {
    let args = vars.expand_all(args).map_err(|e| e.to_string())?;
    let env = vars.expand_map(env).map_err(|e| e.to_string())?;

    let mut command = Command::new(layout.store.join(program));
    command.args(args).envs(env).current_dir(&layout.store);
    Ok(command)
}

/// Create `dir` if missing. Returns whether it was created.
fn ensure_dir(dir: &Path) -> Result<bool, Error> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(false),
        // A symlink to a directory is a user choice; keep it
        Ok(meta) if meta.file_type().is_symlink() && dir.is_dir() => Ok(false),
        Ok(meta) => Err(Error::LinkConflict {
            path: dir.to_path_buf(),
            existing_type: if meta.file_type().is_symlink() {
                LinkConflictType::SymlinkToOther {
                    target: fs::read_link(dir).unwrap_or_default(),
                }
            } else {
                LinkConflictType::RegularFile
            },
        }),
        Err(_) => {
            fs::create_dir_all(dir)
                .map_err(|e| store_err(format!("failed to create {}", dir.display()), e))?;
            debug!(dir = %dir.display(), "created runtime directory");
            Ok(true)
        }
    }
}

fn ensure_link(link: &Path, target: &Path) -> Result<(), Error> {
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let current = fs::read_link(link)
                .map_err(|e| store_err(format!("failed to read {}", link.display()), e))?;
            if current == target {
                return Ok(());
            }
            debug!(link = %link.display(), old = %current.display(), "replacing stale link");
            fs::remove_file(link)
                .map_err(|e| store_err(format!("failed to remove {}", link.display()), e))?;
        }
        Ok(meta) => {
            return Err(Error::LinkConflict {
                path: link.to_path_buf(),
                existing_type: if meta.is_dir() {
                    LinkConflictType::Directory
                } else {
                    LinkConflictType::RegularFile
                },
            });
        }
        Err(_) => {}
    }

    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| store_err(format!("failed to create {}", parent.display()), e))?;
    }
    symlink(target, link)
        .map_err(|e| store_err(format!("failed to link {}", link.display()), e))?;
    debug!(link = %link.display(), target = %target.display(), "linked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kw_core::Prefix;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const SHA: &str = "ac1949836c64d4d1b1b9273400d5fd3a91bb6964ded67d2947e93324fad94028";

    fn setup(tmp: &TempDir, extra: &str) -> (InstallLayout, PackageSpec) {
        let spec = PackageSpec::from_json(&format!(
            r#"{{
                "name": "elasticsearch-full",
                "version": "8.0.0",
                "source": {{ "path": "/unused" }},
                "sha256": "{SHA}",
                "runtime": {{
                    "instance": "elasticsearch_{{user}}",
                    "data": "lib/elasticsearch/{{instance}}",
                    "logs": "log/elasticsearch",
                    "plugins": "elasticsearch/plugins",
                    "links": [
                        {{ "store": "config", "target": "config" }},
                        {{ "store": "plugins", "target": "plugins" }}
                    ]
                }}
                {extra}
            }}"#
        ))
        .unwrap();
        let layout =
            InstallLayout::resolve(&spec, &Prefix::new(&tmp.path().join("p")), "ada").unwrap();
        fs::create_dir_all(&layout.store).unwrap();
        (layout, spec)
    }

    fn tool(layout: &InstallLayout, name: &str, body: &str) {
        let path = layout.store.join("bin").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn self_config_json(program: &str, credential: Option<&str>) -> String {
        let credential = credential
            .map(|c| format!(r#", "credential": {{ "program": "{c}" }}"#))
            .unwrap_or_default();
        format!(r#", "self_config": {{ "program": "{program}", "timeout_secs": 10 {credential} }}"#)
    }

    #[test]
    fn creates_directories_and_links() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(&tmp, "");

        let state = Bootstrapper::new().bootstrap(&layout, &spec, None).unwrap();

        assert_eq!(state.instance, "elasticsearch_ada");
        for dir in &state.directories {
            assert!(dir.is_dir());
        }
        assert!(layout.runtime.data.ends_with("lib/elasticsearch/elasticsearch_ada"));
        assert_eq!(state.links.len(), 2);
        assert_eq!(fs::read_link(layout.store.join("config")).unwrap(), layout.config);
        assert!(layout.store.join("plugins").is_dir());
        assert!(state.self_config.is_none());
    }

    #[test]
    fn second_run_is_identical_and_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(&tmp, "");
        let bootstrapper = Bootstrapper::new();

        let first = bootstrapper.bootstrap(&layout, &spec, None).unwrap();
        fs::write(layout.runtime.data.join("node.lock"), "user data").unwrap();
        let second = bootstrapper.bootstrap(&layout, &spec, None).unwrap();

        assert_eq!(first.directories, second.directories);
        assert_eq!(first.links, second.links);
        assert!(second.created.is_empty());
        assert_eq!(
            fs::read_to_string(layout.runtime.data.join("node.lock")).unwrap(),
            "user data"
        );
        for link in &second.links {
            assert!(link.link.exists(), "broken link {}", link.link.display());
        }
    }

    #[test]
    fn stale_link_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(&tmp, "");
        symlink("/nonexistent", layout.store.join("config")).unwrap();

        Bootstrapper::new().bootstrap(&layout, &spec, None).unwrap();
        assert_eq!(fs::read_link(layout.store.join("config")).unwrap(), layout.config);
    }

    #[test]
    fn real_directory_is_never_replaced() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(&tmp, "");
        fs::create_dir_all(layout.store.join("plugins")).unwrap();
        fs::write(layout.store.join("plugins/keep"), "x").unwrap();

        let err = Bootstrapper::new().bootstrap(&layout, &spec, None).unwrap_err();
        assert!(matches!(
            err,
            Error::LinkConflict {
                existing_type: LinkConflictType::Directory,
                ..
            }
        ));
        assert!(layout.store.join("plugins/keep").exists());
    }

    #[test]
    fn self_config_success_captures_credential() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(
            &tmp,
            &self_config_json("bin/setup", Some("bin/reset-password")),
        );
        tool(&layout, "setup", "exit 0");
        tool(&layout, "reset-password", "echo '  s3cr3t  '");

        let state = Bootstrapper::new().bootstrap(&layout, &spec, None).unwrap();
        assert_eq!(
            state.self_config,
            Some(SelfConfigOutcome::Configured {
                credential: Some("s3cr3t".to_string())
            })
        );
        assert!(state.is_secured());
    }

    #[test]
    fn self_config_already_configured() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(&tmp, &self_config_json("bin/setup", Some("bin/never")));
        tool(&layout, "setup", "exit 80");

        let state = Bootstrapper::new().bootstrap(&layout, &spec, None).unwrap();
        assert_eq!(state.self_config, Some(SelfConfigOutcome::AlreadyConfigured));
        assert_eq!(state.credential(), None);
    }

    #[test]
    fn self_config_failure_is_a_value() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(&tmp, &self_config_json("bin/setup", None));
        tool(&layout, "setup", "echo 'keystore locked' >&2; exit 1");

        let state = Bootstrapper::new().bootstrap(&layout, &spec, None).unwrap();
        match state.self_config {
            Some(SelfConfigOutcome::Failed { exit_code, output }) => {
                assert_eq!(exit_code, Some(1));
                assert!(output.contains("keystore locked"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn empty_credential_is_a_failure() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(
            &tmp,
            &self_config_json("bin/setup", Some("bin/reset-password")),
        );
        tool(&layout, "setup", "exit 0");
        tool(&layout, "reset-password", "exit 0");

        let state = Bootstrapper::new().bootstrap(&layout, &spec, None).unwrap();
        assert!(matches!(
            state.self_config,
            Some(SelfConfigOutcome::Failed { .. })
        ));
    }

    #[test]
    fn missing_tool_is_a_failure() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(&tmp, &self_config_json("bin/absent", None));

        let state = Bootstrapper::new().bootstrap(&layout, &spec, None).unwrap();
        assert!(matches!(
            state.self_config,
            Some(SelfConfigOutcome::Failed {
                exit_code: None,
                ..
            })
        ));
    }

    #[test]
    fn prior_outcome_is_reused_without_running_the_tool() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(&tmp, &self_config_json("bin/setup", None));
        let marker = tmp.path().join("ran");
        tool(&layout, "setup", &format!("touch '{}'", marker.display()));

        let prior = SelfConfigOutcome::Configured {
            credential: Some("earlier".to_string()),
        };
        let state = Bootstrapper::new()
            .bootstrap(&layout, &spec, Some(&prior))
            .unwrap();

        assert_eq!(state.self_config, Some(prior));
        assert!(!marker.exists());
    }

    #[test]
    fn self_config_runs_in_store_with_expanded_env() {
        let tmp = TempDir::new().unwrap();
        let (layout, spec) = setup(
            &tmp,
            r#", "self_config": { "program": "bin/setup", "env": { "ES_PATH_CONF": "{config}" }, "credential": { "program": "bin/show" } }"#,
        );
        tool(&layout, "setup", "pwd > cwd; echo \"$ES_PATH_CONF\" > conf");
        tool(&layout, "show", "cat conf");

        let state = Bootstrapper::new().bootstrap(&layout, &spec, None).unwrap();
        assert_eq!(
            state.credential(),
            Some(layout.config.display().to_string().as_str())
        );
        let cwd = fs::read_to_string(layout.store.join("cwd")).unwrap();
        assert_eq!(
            fs::canonicalize(cwd.trim()).unwrap(),
            fs::canonicalize(&layout.store).unwrap()
        );
    }
}
