use std::path::Path;

use console::style;

use kw_io::install::Installer;

use crate::display::{header, load_declaration, print_self_config};

pub fn run(installer: &mut Installer, declaration: &Path) -> Result<(), kw_core::Error> {
    let spec = load_declaration(declaration)?;
    header(format!("Bootstrapping {}", style(&spec.name).bold()));

    let state = installer.bootstrap(&spec)?;

    for dir in &state.directories {
        let marker = if state.created.contains(dir) {
            style("created").green()
        } else {
            style("exists").dim()
        };
        println!("    {} {} {}", style("✓").green(), dir.display(), marker);
    }
    for link in &state.links {
        println!(
            "    {} {} -> {}",
            style("✓").green(),
            link.link.display(),
            link.target.display()
        );
    }
    if let Some(outcome) = &state.self_config {
        print_self_config(outcome);
    }
    Ok(())
}
