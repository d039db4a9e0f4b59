use std::path::{Path, PathBuf};

/// Directory roots derived from an install prefix.
///
/// ```text
/// <prefix>/Cellar/<name>/<version>   immutable keg (store)
/// <prefix>/opt/<name>                stable link to the current keg
/// <prefix>/etc/<name>                mutable config, kept across upgrades
/// <prefix>/var                       mutable runtime data, logs, plugins
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    root: PathBuf,
}

impl Prefix {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cellar(&self) -> PathBuf {
        self.root.join("Cellar")
    }

    pub fn rack(&self, name: &str) -> PathBuf {
        self.cellar().join(name)
    }

    pub fn keg(&self, name: &str, version: &str) -> PathBuf {
        self.rack(name).join(version)
    }

    pub fn opt(&self, name: &str) -> PathBuf {
        self.root.join("opt").join(name)
    }

    pub fn etc(&self) -> PathBuf {
        self.root.join("etc")
    }

    pub fn var(&self) -> PathBuf {
        self.root.join("var")
    }
}
