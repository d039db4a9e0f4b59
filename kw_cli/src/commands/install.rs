//! Install command implementation.

use std::path::Path;
use std::time::Instant;

use console::style;

use kw_core::caveats;
use kw_io::install::{InstallOptions, Installer};

use crate::display::{header, load_declaration, print_self_config, print_warnings, spinner};

pub async fn run(
    installer: &mut Installer,
    declaration: &Path,
    no_bootstrap: bool,
    no_service: bool,
) -> Result<(), kw_core::Error> {
    let spec = load_declaration(declaration)?;
    let start = Instant::now();

    header(format!(
        "Installing {} {}",
        style(&spec.name).bold(),
        style(&spec.version).dim()
    ));

    let pb = spinner(&spec.name, &format!("fetching {}", spec.source.display_name()));
    let options = InstallOptions {
        bootstrap: !no_bootstrap,
        register_service: !no_service,
    };
    let result = installer.install(&spec, options).await;
    pb.finish_and_clear();
    let result = result?;

    let layout = &result.layout;
    println!(
        "    {} {} {}",
        style("✓").green(),
        layout.keg.display(),
        style(if result.artifact.reused {
            "(cached artifact)"
        } else {
            "(verified)"
        })
        .dim()
    );
    if !layout.wrappers.is_empty() {
        println!("    {} wrappers: {}", style("✓").green(), layout.wrappers.join(", "));
    }
    if let Some(desc) = &result.service {
        let state = if no_service { "described" } else { "registered" };
        println!("    {} service {} {}", style("✓").green(), desc.label, state);
    }
    print_warnings(&layout.warnings);

    if let Some(runtime) = &result.runtime
        && let Some(outcome) = &runtime.self_config
    {
        print_self_config(outcome);
    }

    header(format!(
        "Installed {} in {:.2}s",
        style(&spec.name).green().bold(),
        start.elapsed().as_secs_f64()
    ));

    println!();
    header("Caveats");
    print!("{}", caveats::render(layout, result.runtime.as_ref()));
    Ok(())
}
