//! Read-only commands: caveats, list, digest and check.

use std::path::Path;

use console::style;

use kw_io::digest::digest_path;
use kw_io::install::Installer;

use crate::display::{format_timestamp, header, load_declaration};

pub fn run_caveats(installer: &Installer, declaration: &Path) -> Result<(), kw_core::Error> {
    let spec = load_declaration(declaration)?;
    print!("{}", installer.caveats(&spec)?);
    Ok(())
}

pub fn run_list(installer: &Installer, json: bool) -> Result<(), kw_core::Error> {
    let installed = installer.list_installed()?;

    if json {
        let entries: Vec<serde_json::Value> = installed
            .iter()
            .map(|pkg| {
                serde_json::json!({
                    "name": pkg.name,
                    "version": pkg.version,
                    "sha256": pkg.sha256,
                    "keg": pkg.layout.keg.to_string_lossy(),
                    "instance": pkg.layout.instance,
                    "installed_at": pkg.installed_at,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
        );
        return Ok(());
    }

    if installed.is_empty() {
        println!("No packages installed.");
        return Ok(());
    }
    for pkg in installed {
        println!(
            "{} {} {}",
            style(&pkg.name).bold(),
            style(&pkg.version).green(),
            style(format_timestamp(pkg.installed_at)).dim()
        );
    }
    Ok(())
}

pub fn run_digest(path: &Path) -> Result<(), kw_core::Error> {
    let digest = digest_path(path).map_err(|e| kw_core::Error::Fetch {
        location: path.display().to_string(),
        message: e.to_string(),
    })?;
    println!("{digest}  {}", path.display());
    Ok(())
}

pub fn run_check(declaration: &Path) -> Result<(), kw_core::Error> {
    let spec = load_declaration(declaration)?;
    header(format!(
        "{} {} is a valid declaration",
        style(&spec.name).bold(),
        spec.version
    ));
    println!("    source: {}", spec.source.display_name());
    if let Some(test) = &spec.smoke_test {
        let names: Vec<&str> = test.scenarios.iter().map(|s| s.name.as_str()).collect();
        println!("    scenarios: {}", names.join(", "));
    }
    Ok(())
}
