//! Smoke test command implementation.

use std::path::Path;
use std::time::Instant;

use console::style;

use kw_io::install::Installer;

use crate::display::{header, load_declaration, print_report};

pub async fn run(
    installer: &Installer,
    declaration: &Path,
    scenario: Option<&str>,
) -> Result<(), kw_core::Error> {
    let spec = load_declaration(declaration)?;
    let start = Instant::now();

    if spec.smoke_test.is_none() {
        println!("{} declares no smoke test.", spec.name);
        return Ok(());
    }

    header(format!("Testing {} {}", style(&spec.name).bold(), spec.version));
    let reports = installer.test(&spec, scenario).await?;

    for report in &reports {
        print_report(report);
    }

    let passed = reports.iter().filter(|r| r.passed()).count();
    let skipped = reports.len() - passed;
    header(format!(
        "{} passed, {} skipped in {:.1}s",
        style(passed).green().bold(),
        skipped,
        start.elapsed().as_secs_f64()
    ));
    Ok(())
}
