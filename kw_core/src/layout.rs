//! Resolved install locations for one package version.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::package::{LinkTarget, PackageSpec, is_safe_relative};
use crate::paths::Prefix;
use crate::template::Vars;

/// Mutable runtime directories under the runtime root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimePaths {
    pub root: PathBuf,
    pub data: PathBuf,
    pub logs: PathBuf,
    pub plugins: Option<PathBuf>,
}

impl RuntimePaths {
    /// Directories the bootstrapper must create.
    pub fn directories(&self) -> Vec<&Path> {
        let mut dirs = vec![self.data.as_path(), self.logs.as_path()];
        if let Some(plugins) = &self.plugins {
            dirs.push(plugins.as_path());
        }
        dirs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallLayout {
    pub name: String,
    pub version: String,
    pub instance: String,
    pub user: String,
    pub prefix: PathBuf,
    /// `<prefix>/Cellar/<name>/<version>`
    pub keg: PathBuf,
    /// `<keg>/libexec`, the immutable package tree
    pub store: PathBuf,
    /// `<keg>/bin`, generated wrappers
    pub bin: PathBuf,
    pub opt: PathBuf,
    pub config: PathBuf,
    pub runtime: RuntimePaths,
    #[serde(default)]
    pub wrappers: Vec<String>,
    /// Entries placed in the config root by this install
    #[serde(default)]
    pub config_entries: Vec<String>,
    /// Entries that already existed in the config root and were left alone
    #[serde(default)]
    pub preserved_config: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl InstallLayout {
    /// Compute every location for `spec` under `prefix` without touching the filesystem.
    pub fn resolve(spec: &PackageSpec, prefix: &Prefix, user: &str) -> Result<Self, Error> {
        let keg = prefix.keg(&spec.name, &spec.version);
        let config = prefix.etc().join(&spec.name);
        let var = prefix.var();

        let mut vars = Vars::new(&spec.name)
            .with("name", spec.name.as_str())
            .with("version", spec.version.as_str())
            .with("user", user)
            .with("prefix", prefix.root().display().to_string());
        let instance = vars.expand(&spec.runtime.instance)?;
        if instance.is_empty() || instance.contains('/') {
            return Err(Error::InvalidPackage {
                name: spec.name.clone(),
                message: format!("instance name '{instance}' must be a single path segment"),
            });
        }
        vars.set("instance", instance.as_str());

        let runtime_dir = |template: &str| -> Result<PathBuf, Error> {
            let rel = vars.expand(template)?;
            if !is_safe_relative(&rel) {
                return Err(Error::InvalidPackage {
                    name: spec.name.clone(),
                    message: format!("runtime path '{rel}' must stay inside {}", var.display()),
                });
            }
            Ok(var.join(rel))
        };

        let runtime = RuntimePaths {
            data: runtime_dir(&spec.runtime.data)?,
            logs: runtime_dir(&spec.runtime.logs)?,
            plugins: spec
                .runtime
                .plugins
                .as_deref()
                .map(&runtime_dir)
                .transpose()?,
            root: var.clone(),
        };

        Ok(Self {
            name: spec.name.clone(),
            version: spec.version.clone(),
            instance,
            user: user.to_string(),
            prefix: prefix.root().to_path_buf(),
            store: keg.join("libexec"),
            bin: keg.join("bin"),
            opt: prefix.opt(&spec.name),
            keg,
            config,
            runtime,
            wrappers: Vec::new(),
            config_entries: Vec::new(),
            preserved_config: Vec::new(),
            warnings: Vec::new(),
        })
    }

    /// Placeholder values available to every template of this package.
    pub fn vars(&self) -> Vars {
        let mut vars = Vars::new(&self.name)
            .with("name", self.name.as_str())
            .with("version", self.version.as_str())
            .with("instance", self.instance.as_str())
            .with("user", self.user.as_str())
            .with("prefix", path_str(&self.prefix))
            .with("keg", path_str(&self.keg))
            .with("store", path_str(&self.store))
            .with("bin", path_str(&self.bin))
            .with("opt", path_str(&self.opt))
            .with("config", path_str(&self.config))
            .with("var", path_str(&self.runtime.root))
            .with("data", path_str(&self.runtime.data))
            .with("logs", path_str(&self.runtime.logs));
        if let Some(plugins) = &self.runtime.plugins {
            vars.set("plugins", path_str(plugins));
        }
        vars
    }

    pub fn link_target(&self, target: LinkTarget) -> Option<&Path> {
        match target {
            LinkTarget::Config => Some(&self.config),
            LinkTarget::Data => Some(&self.runtime.data),
            LinkTarget::Logs => Some(&self.runtime.logs),
            LinkTarget::Plugins => self.runtime.plugins.as_deref(),
        }
    }

    pub fn wrapper_path(&self, name: &str) -> PathBuf {
        self.bin.join(name)
    }

    /// Wrapper path through `opt/`, stable across upgrades.
    pub fn opt_bin(&self, name: &str) -> PathBuf {
        self.opt.join("bin").join(name)
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}
