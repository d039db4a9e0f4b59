//! Service command implementations.

use std::path::Path;

use console::style;

use kw_io::ServiceStatus;
use kw_io::install::Installer;

use crate::ServiceAction;
use crate::display::{header, load_declaration};

pub fn run(
    installer: &Installer,
    declaration: &Path,
    action: ServiceAction,
) -> Result<(), kw_core::Error> {
    let spec = load_declaration(declaration)?;
    let Some(desc) = installer.service_descriptor(&spec)? else {
        return Err(kw_core::Error::InvalidPackage {
            name: spec.name.clone(),
            message: "declaration has no service".to_string(),
        });
    };
    let manager = installer.services();

    match action {
        ServiceAction::Render => {
            print!("{}", manager.render(&desc));
        }
        ServiceAction::Install => {
            let path = manager.install(&spec.name, &desc)?;
            header(format!("Wrote {}", path.display()));
        }
        ServiceAction::Start => {
            header(format!("Starting {}...", style(&desc.label).bold()));
            manager.start(&spec.name)?;
            println!("    {} started", style("✓").green());
        }
        ServiceAction::Stop => {
            header(format!("Stopping {}...", style(&desc.label).bold()));
            manager.stop(&spec.name)?;
            println!("    {} stopped", style("✓").green());
        }
        ServiceAction::Restart => {
            header(format!("Restarting {}...", style(&desc.label).bold()));
            manager.restart(&spec.name)?;
            println!("    {} restarted", style("✓").green());
        }
        ServiceAction::Remove => {
            manager.remove(&spec.name)?;
            header(format!("Removed {}", desc.label));
        }
        ServiceAction::Status => {
            let status = manager.status(&spec.name);
            let styled = match &status {
                ServiceStatus::Running => style(status.to_string()).green(),
                ServiceStatus::Error(_) => style(status.to_string()).red(),
                _ => style(status.to_string()).dim(),
            };
            println!("{} {}", style(&desc.label).bold(), styled);
            println!("    file: {}", manager.service_file_path(&spec.name).display());
            println!("    logs: {}", desc.stdout_log.display());
        }
    }
    Ok(())
}
