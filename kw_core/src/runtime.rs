use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Result of the one-shot self-configuration step.
///
/// Exactly one variant is reported per bootstrap; callers must not collapse
/// it to a boolean because "already configured" is neither success nor failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SelfConfigOutcome {
    /// Security material was generated; the credential is the captured secret
    Configured { credential: Option<String> },
    /// The package reported it was configured before and changed nothing
    AlreadyConfigured,
    /// Self-configuration did not complete; the package runs unauthenticated
    Failed {
        exit_code: Option<i32>,
        output: String,
    },
}

impl SelfConfigOutcome {
    pub fn credential(&self) -> Option<&str> {
        match self {
            SelfConfigOutcome::Configured { credential } => credential.as_deref(),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SelfConfigOutcome::Configured { .. } => "configured",
            SelfConfigOutcome::AlreadyConfigured => "already configured",
            SelfConfigOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeLinkState {
    pub link: PathBuf,
    pub target: PathBuf,
}

/// Runtime directories and links established for one package instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeState {
    pub instance: String,
    /// Declared runtime directories, sorted
    pub directories: Vec<PathBuf>,
    /// Directories that did not exist before this bootstrap
    #[serde(default)]
    pub created: Vec<PathBuf>,
    pub links: Vec<RuntimeLinkState>,
    #[serde(default)]
    pub self_config: Option<SelfConfigOutcome>,
}

impl RuntimeState {
    pub fn credential(&self) -> Option<&str> {
        self.self_config.as_ref().and_then(SelfConfigOutcome::credential)
    }

    /// Whether scenarios that need the generated credential can run.
    pub fn is_secured(&self) -> bool {
        matches!(
            self.self_config,
            Some(SelfConfigOutcome::Configured {
                credential: Some(_)
            })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(outcome: Option<SelfConfigOutcome>) -> RuntimeState {
        RuntimeState {
            instance: "es".to_string(),
            directories: Vec::new(),
            created: Vec::new(),
            links: Vec::new(),
            self_config: outcome,
        }
    }

    #[test]
    fn only_configured_exposes_credential() {
        let configured = state(Some(SelfConfigOutcome::Configured {
            credential: Some("s3cret".to_string()),
        }));
        let already = state(Some(SelfConfigOutcome::AlreadyConfigured));
        let failed = state(Some(SelfConfigOutcome::Failed {
            exit_code: Some(1),
            output: String::new(),
        }));

        assert_eq!(configured.credential(), Some("s3cret"));
        assert!(configured.is_secured());
        assert_eq!(already.credential(), None);
        assert!(!already.is_secured());
        assert!(!failed.is_secured());
        assert!(!state(None).is_secured());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_string(&SelfConfigOutcome::AlreadyConfigured).unwrap();
        assert_eq!(json, r#"{"status":"already_configured"}"#);

        let back: SelfConfigOutcome =
            serde_json::from_str(r#"{"status":"failed","exit_code":2,"output":"boom"}"#).unwrap();
        assert_eq!(back.label(), "failed");
    }
}
