pub mod caveats;
pub mod errors;
pub mod layout;
pub mod package;
pub mod paths;
pub mod runtime;
pub mod service;
pub mod substitute;
pub mod template;

pub use errors::{Error, LinkConflictType};
pub use layout::{InstallLayout, RuntimePaths};
pub use package::{
    CommandSpec, CompanionSpec, ConfigSplit, LinkTarget, MatchKind, PackageSpec, PathSelector,
    ProbeSpec, RuntimeLink, RuntimeSpec, ScenarioSpec, SelfConfigSpec, ServiceSpec, SigningRule,
    SmokeTestSpec, SourceRef, Substitution, WrapperSpec,
};
pub use paths::Prefix;
pub use runtime::{RuntimeLinkState, RuntimeState, SelfConfigOutcome};
pub use service::{RestartPolicy, ServiceDescriptor};
pub use template::Vars;
