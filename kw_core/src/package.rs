//! Package declarations.
//!
//! A declaration is a JSON document describing where an artifact comes from,
//! how its unpacked tree maps onto the store, config and runtime roots, and
//! how the installed result is activated and smoke tested.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Exit code used by self-configuration tools to report "already configured".
pub const DEFAULT_ALREADY_CONFIGURED_EXIT_CODE: i32 = 80;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    /// Packages that must not be installed alongside this one
    #[serde(default)]
    pub conflicts_with: Vec<String>,
    pub source: SourceRef,
    /// Expected SHA-256 of the artifact (tree digest for directory sources)
    pub sha256: String,
    /// Subpaths of the unpacked tree copied into the store
    #[serde(default)]
    pub install: Vec<PathSelector>,
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    #[serde(default)]
    pub config: Option<ConfigSplit>,
    #[serde(default)]
    pub wrappers: Vec<WrapperSpec>,
    #[serde(default)]
    pub signing: Vec<SigningRule>,
    #[serde(default)]
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub self_config: Option<SelfConfigSpec>,
    #[serde(default)]
    pub service: Option<ServiceSpec>,
    #[serde(default)]
    pub smoke_test: Option<SmokeTestSpec>,
}

/// Where an artifact comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceRef {
    /// `http(s)://` or `file://` URL
    Url(String),
    /// Local file or directory
    Path(PathBuf),
}

impl SourceRef {
    /// The local filesystem path this source refers to, if it is not remote.
    pub fn local_path(&self) -> Option<PathBuf> {
        match self {
            SourceRef::Path(path) => Some(path.clone()),
            SourceRef::Url(url) => url.strip_prefix("file://").map(|rest| {
                // file:///a/b and file://localhost/a/b both name /a/b
                PathBuf::from(rest.strip_prefix("localhost").unwrap_or(rest))
            }),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            SourceRef::Url(url) => url.clone(),
            SourceRef::Path(path) => path.display().to_string(),
        }
    }

    /// Last path segment, used to label downloads and errors.
    pub fn file_name(&self) -> Option<String> {
        let raw = match self {
            SourceRef::Url(url) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
            SourceRef::Path(path) => path.display().to_string(),
        };
        raw.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(String::from)
    }
}

/// A subpath of the unpacked tree to install into the store.
///
/// Either a bare relative path (`"bin"`, `"bin/"`), installed under the same
/// name, or a `{ "from": .., "to": .. }` mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PathSelector {
    Same(String),
    Mapped { from: String, to: String },
}

impl PathSelector {
    pub fn source(&self) -> &str {
        match self {
            PathSelector::Same(path) => path.trim_end_matches('/'),
            PathSelector::Mapped { from, .. } => from.trim_end_matches('/'),
        }
    }

    pub fn destination(&self) -> &str {
        match self {
            PathSelector::Same(path) => path.trim_end_matches('/'),
            PathSelector::Mapped { to, .. } => to.trim_end_matches('/'),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    #[default]
    Literal,
    Regex,
}

/// A text rewrite applied to one installed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Substitution {
    /// Target file, relative to the store
    pub file: String,
    pub pattern: String,
    /// Replacement text; placeholders like `{config}` are expanded
    pub replacement: String,
    #[serde(default)]
    pub kind: MatchKind,
    #[serde(default)]
    pub replace_all: bool,
    /// Exact number of matches required
    #[serde(default)]
    pub count: Option<usize>,
}

impl Substitution {
    /// Number of matches the rule requires, `None` meaning "at least one".
    pub fn expected_matches(&self) -> Option<usize> {
        match (self.count, self.replace_all) {
            (Some(n), _) => Some(n),
            (None, false) => Some(1),
            (None, true) => None,
        }
    }
}

/// How an upstream config directory is split between the config root and the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigSplit {
    /// Directory holding the config entries, relative to the store and
    /// falling back to the unpacked tree
    #[serde(default = "default_config_source")]
    pub source: String,
    /// Entries moved to the config root; empty moves everything not kept
    #[serde(default)]
    pub include: Vec<String>,
    /// Entries of `include` that may be absent upstream
    #[serde(default)]
    pub optional: Vec<String>,
    /// Entries that stay in the store as immutable defaults
    #[serde(default)]
    pub keep: Vec<String>,
}

fn default_config_source() -> String {
    "config".to_string()
}

/// Generates `bin/` dispatch wrappers for extension-less files in a store directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WrapperSpec {
    pub dir: String,
    /// Arguments inserted before the caller's arguments
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SigningRule {
    /// Subtree of the store whose regular files are re-signed
    pub path: String,
    /// Whether a signing failure aborts the install
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// Runtime directory layout, relative to the runtime root (`<prefix>/var`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSpec {
    #[serde(default = "default_instance")]
    pub instance: String,
    #[serde(default = "default_data")]
    pub data: String,
    #[serde(default = "default_logs")]
    pub logs: String,
    #[serde(default)]
    pub plugins: Option<String>,
    #[serde(default)]
    pub links: Vec<RuntimeLink>,
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            data: default_data(),
            logs: default_logs(),
            plugins: None,
            links: Vec::new(),
        }
    }
}

fn default_instance() -> String {
    "{name}".to_string()
}

fn default_data() -> String {
    "lib/{name}/{instance}".to_string()
}

fn default_logs() -> String {
    "log/{name}".to_string()
}

/// A symlink from a fixed path inside the store to a mutable root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeLink {
    /// Link location, relative to the store
    pub store: String,
    pub target: LinkTarget,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkTarget {
    Config,
    Data,
    Logs,
    Plugins,
}

/// One-shot invocation of the installed package that generates security material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SelfConfigSpec {
    /// Program relative to the store
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Follow-up step whose stdout is the generated credential
    #[serde(default)]
    pub credential: Option<CommandSpec>,
    #[serde(default = "default_already_configured")]
    pub already_configured_exit_code: i32,
    #[serde(default = "default_self_config_timeout")]
    pub timeout_secs: u64,
}

fn default_already_configured() -> i32 {
    DEFAULT_ALREADY_CONFIGURED_EXIT_CODE
}

fn default_self_config_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Wrapper name under `bin/`
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default = "default_true")]
    pub run_at_load: bool,
    /// Log file stem under the log root; defaults to the package name
    #[serde(default)]
    pub log_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SmokeTestSpec {
    /// User name paired with the captured credential for authenticated probes
    #[serde(default)]
    pub credential_user: Option<String>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScenarioSpec {
    pub name: String,
    /// Wrapper name under `bin/`
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Commands (wrapper name followed by arguments) run before launch
    #[serde(default)]
    pub pre_commands: Vec<Vec<String>>,
    /// Entries (glob patterns) copied from the config root into the scratch config
    #[serde(default)]
    pub copy_config: Vec<String>,
    /// Files written into the scratch config, name to template
    #[serde(default)]
    pub config_files: BTreeMap<String, String>,
    /// The program daemonizes and records its PID in `{pid_file}`
    #[serde(default)]
    pub pid_file: bool,
    /// Node name template; defaults to `test-<scenario>`
    #[serde(default)]
    pub node: Option<String>,
    pub probe: ProbeSpec,
    /// Marker the probe response must contain
    pub expect: String,
    #[serde(default)]
    pub requires_credential: bool,
    #[serde(default)]
    pub companion: Option<CompanionSpec>,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

fn default_ready_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProbeSpec {
    Http {
        path: String,
        #[serde(default)]
        tls: bool,
    },
    File {
        path: String,
    },
}

/// In-process TCP responder the package under test talks to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CompanionSpec {
    pub expect: String,
    pub reply: String,
}

impl PackageSpec {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let spec: PackageSpec =
            serde_json::from_str(json).map_err(|e| Error::InvalidPackage {
                name: "<unparsed>".to_string(),
                message: e.to_string(),
            })?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let json = std::fs::read_to_string(path).map_err(|e| Error::InvalidPackage {
            name: path.display().to_string(),
            message: format!("failed to read declaration: {e}"),
        })?;
        Self::from_json(&json)
    }

    fn invalid(&self, message: impl Into<String>) -> Error {
        Error::InvalidPackage {
            name: self.name.clone(),
            message: message.into(),
        }
    }

    /// Check everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() || self.name.contains('/') || self.name.starts_with('.') {
            return Err(self.invalid("name must be a non-empty single path segment"));
        }
        if self.version.is_empty() || self.version.contains('/') || self.version.starts_with('.')
        {
            return Err(self.invalid("version must be a non-empty single path segment"));
        }
        if self.sha256.len() != 64 || !self.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(self.invalid(format!(
                "sha256 must be 64 hex characters, got '{}'",
                self.sha256
            )));
        }

        for selector in &self.install {
            self.check_relative("install selector", selector.source())?;
            self.check_relative("install destination", selector.destination())?;
        }

        for rule in &self.substitutions {
            self.check_relative("substitution file", &rule.file)?;
            if rule.pattern.is_empty() {
                return Err(self.invalid(format!("empty pattern for '{}'", rule.file)));
            }
            if rule.kind == MatchKind::Regex
                && let Err(e) = Regex::new(&rule.pattern)
            {
                return Err(self.invalid(format!("invalid pattern '{}': {e}", rule.pattern)));
            }
            if rule.count == Some(0) {
                return Err(self.invalid(format!("count must be positive for '{}'", rule.file)));
            }
            if let Some(n) = rule.count
                && n > 1
                && !rule.replace_all
            {
                return Err(self.invalid(format!(
                    "count {n} for '{}' requires replace_all",
                    rule.file
                )));
            }
        }

        if let Some(config) = &self.config {
            if config.source != "." {
                self.check_relative("config source", &config.source)?;
            }
            for entry in config.include.iter().chain(&config.keep) {
                self.check_entry_name("config entry", entry)?;
            }
            if let Some(both) = config.include.iter().find(|e| config.keep.contains(e)) {
                return Err(self.invalid(format!(
                    "config entry '{both}' cannot be both moved and kept"
                )));
            }
        }

        for wrapper in &self.wrappers {
            self.check_relative("wrapper dir", &wrapper.dir)?;
        }
        for rule in &self.signing {
            self.check_relative("signing path", &rule.path)?;
        }
        for link in &self.runtime.links {
            self.check_relative("runtime link", &link.store)?;
            if link.target == LinkTarget::Plugins && self.runtime.plugins.is_none() {
                return Err(self.invalid("plugins link declared without a plugins directory"));
            }
        }
        if let Some(self_config) = &self.self_config {
            self.check_relative("self_config program", &self_config.program)?;
            if let Some(step) = &self_config.credential {
                self.check_relative("credential program", &step.program)?;
            }
        }
        if let Some(service) = &self.service {
            self.check_entry_name("service program", &service.program)?;
        }

        if let Some(test) = &self.smoke_test {
            let mut seen = BTreeSet::new();
            for scenario in &test.scenarios {
                if !seen.insert(scenario.name.as_str()) {
                    return Err(self.invalid(format!(
                        "duplicate smoke test scenario '{}'",
                        scenario.name
                    )));
                }
                self.check_entry_name("scenario program", &scenario.program)?;
                if scenario.pre_commands.iter().any(|cmd| cmd.is_empty()) {
                    return Err(self.invalid(format!(
                        "empty pre_command in scenario '{}'",
                        scenario.name
                    )));
                }
                for name in scenario.config_files.keys() {
                    self.check_entry_name("scenario config file", name)?;
                }
                if scenario.ready_timeout_secs == 0 {
                    return Err(self.invalid(format!(
                        "ready_timeout_secs must be positive in scenario '{}'",
                        scenario.name
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_relative(&self, what: &str, path: &str) -> Result<(), Error> {
        if !is_safe_relative(path) {
            return Err(self.invalid(format!(
                "{what} '{path}' must be a relative path without '..'"
            )));
        }
        Ok(())
    }

    fn check_entry_name(&self, what: &str, name: &str) -> Result<(), Error> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(self.invalid(format!("{what} '{name}' must be a single file name")));
        }
        Ok(())
    }
}

/// True for non-empty relative paths that never climb out of their base.
pub fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    if path.as_os_str().is_empty() {
        return false;
    }
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "ac1949836c64d4d1b1b9273400d5fd3a91bb6964ded67d2947e93324fad94028";

    fn minimal_json(extra: &str) -> String {
        format!(
            r#"{{
                "name": "heartbeat",
                "version": "7.14.1",
                "source": {{ "url": "https://example.com/heartbeat-7.14.1.tar.gz?channel=x" }},
                "sha256": "{SHA}"
                {extra}
            }}"#
        )
    }

    #[test]
    fn parses_minimal_declaration_with_defaults() {
        let spec = PackageSpec::from_json(&minimal_json("")).unwrap();

        assert_eq!(spec.name, "heartbeat");
        assert!(spec.install.is_empty());
        assert_eq!(spec.runtime.instance, "{name}");
        assert_eq!(spec.runtime.data, "lib/{name}/{instance}");
        assert!(spec.self_config.is_none());
    }

    #[test]
    fn parses_selectors_in_both_forms() {
        let spec = PackageSpec::from_json(&minimal_json(
            r#", "install": ["bin/", { "from": "heartbeat", "to": "bin/heartbeat" }]"#,
        ))
        .unwrap();

        assert_eq!(spec.install[0].source(), "bin");
        assert_eq!(spec.install[0].destination(), "bin");
        assert_eq!(spec.install[1].source(), "heartbeat");
        assert_eq!(spec.install[1].destination(), "bin/heartbeat");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err =
            PackageSpec::from_json(&minimal_json(r#", "mirror_list": "unneeded""#)).unwrap_err();
        assert!(matches!(err, Error::InvalidPackage { .. }));
    }

    #[test]
    fn rejects_malformed_hash() {
        let json = minimal_json("").replace(SHA, "abc");
        let err = PackageSpec::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("sha256"));
    }

    #[test]
    fn rejects_selector_escaping_the_tree() {
        let err =
            PackageSpec::from_json(&minimal_json(r#", "install": ["../etc"]"#)).unwrap_err();
        assert!(err.to_string().contains("'..'"));
    }

    #[test]
    fn rejects_invalid_regex() {
        let err = PackageSpec::from_json(&minimal_json(
            r#", "substitutions": [{ "file": "a.yml", "pattern": "(", "replacement": "x", "kind": "regex" }]"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("invalid pattern"));
    }

    #[test]
    fn rejects_duplicate_scenarios() {
        let scenario = r#"{ "name": "a", "program": "hb", "probe": { "type": "file", "path": "x" }, "expect": "up" }"#;
        let err = PackageSpec::from_json(&minimal_json(&format!(
            r#", "smoke_test": {{ "scenarios": [{scenario}, {scenario}] }}"#
        )))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_plugins_link_without_plugins_dir() {
        let err = PackageSpec::from_json(&minimal_json(
            r#", "runtime": { "links": [{ "store": "plugins", "target": "plugins" }] }"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("plugins"));
    }

    #[test]
    fn expected_matches_follows_mode() {
        let mut rule = Substitution {
            file: "f".to_string(),
            pattern: "p".to_string(),
            replacement: "r".to_string(),
            kind: MatchKind::Literal,
            replace_all: false,
            count: None,
        };
        assert_eq!(rule.expected_matches(), Some(1));
        rule.replace_all = true;
        assert_eq!(rule.expected_matches(), None);
        rule.count = Some(3);
        assert_eq!(rule.expected_matches(), Some(3));
    }

    #[test]
    fn rejects_count_above_one_without_replace_all() {
        let rule = r#", "substitutions": [{
            "file": "config/app.yml",
            "pattern": "PLACEHOLDER_LOG_DIR",
            "replacement": "{logs}",
            "count": 2
        }]"#;
        let err = PackageSpec::from_json(&minimal_json(rule)).unwrap_err();
        assert!(err.to_string().contains("requires replace_all"));

        let with_all = rule.replace(r#""count": 2"#, r#""count": 2, "replace_all": true"#);
        assert!(PackageSpec::from_json(&minimal_json(&with_all)).is_ok());
    }

    #[test]
    fn file_url_resolves_to_local_path() {
        let source = SourceRef::Url("file:///path/here".to_string());
        assert_eq!(source.local_path(), Some(PathBuf::from("/path/here")));

        let remote = SourceRef::Url("https://example.com/a.tar.gz".to_string());
        assert_eq!(remote.local_path(), None);
    }

    #[test]
    fn file_name_ignores_query_string() {
        let source = SourceRef::Url(
            "https://artifacts.example.com/heartbeat-7.14.1-darwin-x86_64.tar.gz?channel=elastic"
                .to_string(),
        );
        assert_eq!(
            source.file_name().as_deref(),
            Some("heartbeat-7.14.1-darwin-x86_64.tar.gz")
        );
    }

    #[test]
    fn safe_relative_paths() {
        assert!(is_safe_relative("bin"));
        assert!(is_safe_relative("lib/tools/security-cli"));
        assert!(is_safe_relative("./config"));
        assert!(!is_safe_relative(""));
        assert!(!is_safe_relative("/etc"));
        assert!(!is_safe_relative("a/../../b"));
    }
}
