//! Post-install guidance text.

use crate::layout::InstallLayout;
use crate::runtime::{RuntimeState, SelfConfigOutcome};

const BANNER_WIDTH: usize = 78;

/// Summarise where data, logs, plugins and config live, plus the
/// self-configuration outcome when there is one.
pub fn render(layout: &InstallLayout, state: Option<&RuntimeState>) -> String {
    let mut out = String::new();
    out.push_str(&format!("Data:    {}/\n", layout.runtime.data.display()));
    out.push_str(&format!("Logs:    {}/\n", layout.runtime.logs.display()));
    if let Some(plugins) = &layout.runtime.plugins {
        out.push_str(&format!("Plugins: {}/\n", plugins.display()));
    }
    out.push_str(&format!("Config:  {}/\n", layout.config.display()));

    if !layout.preserved_config.is_empty() {
        out.push_str(&format!(
            "\nExisting config was kept: {}\n",
            layout.preserved_config.join(", ")
        ));
    }

    for warning in &layout.warnings {
        out.push_str(&format!("\nWarning: {warning}\n"));
    }

    if let Some(outcome) = state.and_then(|s| s.self_config.as_ref()) {
        out.push('\n');
        out.push_str(&banner(&self_config_lines(outcome)));
    }

    out
}

fn self_config_lines(outcome: &SelfConfigOutcome) -> Vec<String> {
    match outcome {
        SelfConfigOutcome::Configured { credential } => {
            let mut lines = vec![
                "Authentication and authorization are enabled.".to_string(),
                "TLS is enabled and configured.".to_string(),
            ];
            match credential {
                Some(secret) => lines.push(format!("Generated password: {secret}")),
                None => lines.push("No password was captured.".to_string()),
            }
            lines
        }
        SelfConfigOutcome::AlreadyConfigured => {
            vec!["Security features appear to be configured already.".to_string()]
        }
        SelfConfigOutcome::Failed { exit_code, .. } => {
            let code = exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string());
            vec![
                format!("WARNING: security self-configuration failed (exit status {code})."),
                "The service will start without generated credentials.".to_string(),
                "Reset the password with the package's own tooling.".to_string(),
            ]
        }
    }
}

fn banner(lines: &[String]) -> String {
    let title = " Security self-configuration ";
    let pad = BANNER_WIDTH.saturating_sub(title.len());
    let mut out = format!(
        "{}{}{}\n",
        "#".repeat(pad / 2),
        title,
        "#".repeat(pad - pad / 2)
    );
    for line in lines {
        let inner = BANNER_WIDTH.saturating_sub(4);
        out.push_str(&format!("# {:<inner$} #\n", line));
    }
    out.push_str(&"#".repeat(BANNER_WIDTH));
    out.push('\n');
    out
}
