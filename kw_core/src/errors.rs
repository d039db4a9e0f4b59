use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Fetch {
        location: String,
        message: String,
    },
    Integrity {
        expected: String,
        actual: String,
        file_name: Option<String>,
    },
    LayoutMismatch {
        path: PathBuf,
        message: String,
    },
    Signing {
        path: PathBuf,
        message: String,
    },
    LinkConflict {
        path: PathBuf,
        existing_type: LinkConflictType,
    },
    Timeout {
        what: String,
        waited: Duration,
    },
    SmokeTest {
        scenario: String,
        message: String,
        output: String,
    },
    InvalidPackage {
        name: String,
        message: String,
    },
    Conflict {
        name: String,
        installed: String,
    },
    NotInstalled {
        name: String,
    },
    StoreCorruption {
        message: String,
    },
}

/// Type of existing file at a link conflict path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkConflictType {
    RegularFile,
    Directory,
    SymlinkToOther { target: PathBuf },
    Unknown,
}

impl Error {
    /// Whether the error leaves no usable install behind and must not be retried.
    pub fn is_fatal_to_install(&self) -> bool {
        matches!(
            self,
            Error::Integrity { .. }
                | Error::LayoutMismatch { .. }
                | Error::Signing { .. }
                | Error::InvalidPackage { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fetch { location, message } => {
                write!(
                    f,
                    "failed to fetch '{}': {}\n  hint: check the source location and your network connection",
                    location, message
                )
            }
            Error::Integrity {
                expected,
                actual,
                file_name,
            } => {
                write!(f, "checksum verification failed")?;
                if let Some(name) = file_name {
                    write!(f, " for '{}'", name)?;
                }
                write!(f, "\n  expected: {}\n  got:      {}", expected, actual)?;
                write!(
                    f,
                    "\n  hint: the artifact is corrupt or has been tampered with; it was not installed"
                )
            }
            Error::LayoutMismatch { path, message } => {
                write!(
                    f,
                    "unexpected artifact layout at '{}': {}\n  hint: the upstream release layout changed; update the package declaration",
                    path.display(),
                    message
                )
            }
            Error::Signing { path, message } => {
                write!(
                    f,
                    "failed to sign '{}': {}\n  hint: executables under this path will not be allowed to run",
                    path.display(),
                    message
                )
            }
            Error::LinkConflict {
                path,
                existing_type,
            } => {
                let path_str = path.to_string_lossy();
                match existing_type {
                    LinkConflictType::RegularFile => {
                        write!(
                            f,
                            "cannot link '{}' (file already exists)\n  hint: move the existing file out of the way",
                            path_str
                        )
                    }
                    LinkConflictType::Directory => {
                        write!(
                            f,
                            "cannot link '{}' (directory already exists)\n  hint: move the existing directory out of the way; it was left untouched",
                            path_str
                        )
                    }
                    LinkConflictType::SymlinkToOther { target } => {
                        write!(
                            f,
                            "cannot link '{}' (symlink to '{}' already exists)",
                            path_str,
                            target.to_string_lossy()
                        )
                    }
                    LinkConflictType::Unknown => {
                        write!(f, "cannot link '{}' (path already exists)", path_str)
                    }
                }
            }
            Error::Timeout { what, waited } => {
                write!(
                    f,
                    "timed out after {:.1}s waiting for {}\n  hint: the service may need more time to start; raise ready_timeout_secs",
                    waited.as_secs_f64(),
                    what
                )
            }
            Error::SmokeTest {
                scenario,
                message,
                output,
            } => {
                write!(f, "smoke test '{}' failed: {}", scenario, message)?;
                if !output.trim().is_empty() {
                    write!(f, "\n  captured output:")?;
                    for line in output.lines() {
                        write!(f, "\n    {}", line)?;
                    }
                }
                Ok(())
            }
            Error::InvalidPackage { name, message } => {
                write!(
                    f,
                    "invalid package declaration '{}': {}\n  hint: run 'kw check <declaration>' to validate it",
                    name, message
                )
            }
            Error::Conflict { name, installed } => {
                write!(
                    f,
                    "'{}' conflicts with the installed package '{}'\n  hint: uninstall '{}' first",
                    name, installed, installed
                )
            }
            Error::NotInstalled { name } => {
                write!(
                    f,
                    "package '{}' is not installed\n  hint: run 'kw install <declaration>' to install it",
                    name
                )
            }
            Error::StoreCorruption { message } => {
                write!(
                    f,
                    "store error: {}\n  hint: run 'kw cleanup' to remove interrupted installs",
                    message
                )
            }
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_display_includes_both_digests() {
        let err = Error::Integrity {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
            file_name: Some("heartbeat".to_string()),
        };

        let msg = err.to_string();
        assert!(msg.contains("heartbeat"));
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
        assert!(msg.contains("hint:"));
    }

    #[test]
    fn layout_mismatch_display_names_the_file() {
        let err = Error::LayoutMismatch {
            path: PathBuf::from("/opt/kegwright/Cellar/es/8.0.0/libexec/bin/es-env"),
            message: "pattern not found".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("es-env"));
        assert!(msg.contains("pattern not found"));
    }

    #[test]
    fn smoke_test_display_indents_captured_output() {
        let err = Error::SmokeTest {
            scenario: "default".to_string(),
            message: "marker not found".to_string(),
            output: "line one\nline two".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("smoke test 'default' failed"));
        assert!(msg.contains("\n    line one\n    line two"));
    }

    #[test]
    fn link_conflict_display_shows_type() {
        let err = Error::LinkConflict {
            path: PathBuf::from("/opt/kegwright/Cellar/es/8.0.0/libexec/config"),
            existing_type: LinkConflictType::Directory,
        };

        let msg = err.to_string();
        assert!(msg.contains("config"));
        assert!(msg.contains("directory already exists"));
    }

    #[test]
    fn fatal_classification() {
        let integrity = Error::Integrity {
            expected: "a".to_string(),
            actual: "b".to_string(),
            file_name: None,
        };
        let timeout = Error::Timeout {
            what: "readiness".to_string(),
            waited: Duration::from_secs(1),
        };
        assert!(integrity.is_fatal_to_install());
        assert!(!timeout.is_fatal_to_install());
    }
}
