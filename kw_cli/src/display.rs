//! Display utilities for progress spinners and formatting helpers.

use std::path::Path;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use kw_core::{Error, PackageSpec, SelfConfigOutcome};
use kw_io::ScenarioOutcome;
use kw_io::smoke::ScenarioReport;

/// Spinner shown while a stage runs.
pub fn spinner(prefix: &str, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner_style) = ProgressStyle::default_spinner()
        .template("    {prefix:<12} {spinner:.cyan} {msg}")
        .map(|s| s.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"))
    {
        pb.set_style(spinner_style);
    }
    pb.set_prefix(prefix.to_string());
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn header(msg: impl std::fmt::Display) {
    println!("{} {}", style("==>").cyan().bold(), msg);
}

pub fn load_declaration(path: &Path) -> Result<PackageSpec, Error> {
    let spec = PackageSpec::from_file(path)?;
    spec.validate()?;
    Ok(spec)
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format a Unix timestamp as UTC `YYYY-MM-DD HH:MM`.
pub fn format_timestamp(timestamp: i64) -> String {
    let days = timestamp.div_euclid(86_400);
    let secs = timestamp.rem_euclid(86_400);

    // Civil-from-days (Howard Hinnant)
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60
    )
}

pub fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("    {} {}", style("!").yellow().bold(), warning);
    }
}

pub fn print_self_config(outcome: &SelfConfigOutcome) {
    match outcome {
        SelfConfigOutcome::Configured { credential } => {
            println!(
                "    {} security self-configuration {}",
                style("✓").green(),
                style("configured").green()
            );
            if credential.is_some() {
                println!("      credential captured (shown in caveats)");
            }
        }
        SelfConfigOutcome::AlreadyConfigured => {
            println!(
                "    {} security self-configuration: {}",
                style("•").dim(),
                style("already configured").dim()
            );
        }
        SelfConfigOutcome::Failed { exit_code, .. } => {
            let code = exit_code.map_or_else(|| "no exit code".to_string(), |c| format!("exit {c}"));
            println!(
                "    {} security self-configuration {} ({code})",
                style("!").yellow().bold(),
                style("failed").yellow()
            );
        }
    }
}

pub fn print_report(report: &ScenarioReport) {
    let secs = report.elapsed.as_secs_f64();
    match &report.outcome {
        ScenarioOutcome::Passed => {
            let port = report
                .port
                .map(|p| format!(" on port {p}"))
                .unwrap_or_default();
            println!(
                "    {} {}{} {}",
                style("✓").green(),
                style(&report.name).bold(),
                port,
                style(format!("({secs:.1}s)")).dim()
            );
        }
        ScenarioOutcome::Skipped { reason } => {
            println!(
                "    {} {} {}",
                style("-").dim(),
                style(&report.name).bold(),
                style(format!("skipped: {reason}")).dim()
            );
        }
    }
}
