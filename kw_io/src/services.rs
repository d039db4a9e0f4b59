//! Registration of service descriptors with the host service manager.
//!
//! - Linux: systemd user units
//! - macOS: launchd LaunchAgents
//!
//! Rendering is pure and available on every platform; only the commands
//! that talk to systemctl/launchctl are platform specific.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use kw_core::service::service_label;
use kw_core::{Error, RestartPolicy, ServiceDescriptor};

const LABEL_PREFIX: &str = "kegwright.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    /// No service file is installed
    NotInstalled,
    Unknown,
    Error(String),
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::NotInstalled => write!(f, "not installed"),
            ServiceStatus::Unknown => write!(f, "unknown"),
            ServiceStatus::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub status: ServiceStatus,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFormat {
    Systemd,
    Launchd,
}

impl ServiceFormat {
    pub fn native() -> Self {
        if cfg!(target_os = "macos") {
            ServiceFormat::Launchd
        } else {
            ServiceFormat::Systemd
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ServiceFormat::Systemd => ".service",
            ServiceFormat::Launchd => ".plist",
        }
    }
}

pub struct ServiceManager {
    service_dir: PathBuf,
    format: ServiceFormat,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::new_with_paths(&Self::default_service_dir())
    }

    /// Service manager writing into `service_dir` instead of the user's
    /// systemd or LaunchAgents directory.
    pub fn new_with_paths(service_dir: &Path) -> Self {
        Self {
            service_dir: service_dir.to_path_buf(),
            format: ServiceFormat::native(),
        }
    }

    #[cfg(target_os = "macos")]
    fn default_service_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/Users".to_string());
        PathBuf::from(home).join("Library/LaunchAgents")
    }

    #[cfg(not(target_os = "macos"))]
    fn default_service_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/home".to_string());
        PathBuf::from(home).join(".config/systemd/user")
    }

    pub fn service_dir(&self) -> &Path {
        &self.service_dir
    }

    pub fn service_file_path(&self, name: &str) -> PathBuf {
        self.service_dir
            .join(format!("{}{}", service_label(name), self.format.extension()))
    }

    pub fn render(&self, desc: &ServiceDescriptor) -> String {
        match self.format {
            ServiceFormat::Systemd => render_systemd(desc),
            ServiceFormat::Launchd => render_launchd(desc),
        }
    }

    /// Write the service file for `desc`. Does not start the service.
    pub fn install(&self, name: &str, desc: &ServiceDescriptor) -> Result<PathBuf, Error> {
        fs::create_dir_all(&self.service_dir).map_err(|e| Error::StoreCorruption {
            message: format!(
                "failed to create service directory {}: {e}",
                self.service_dir.display()
            ),
        })?;
        if let Some(log_dir) = desc.stdout_log.parent() {
            fs::create_dir_all(log_dir).map_err(|e| Error::StoreCorruption {
                message: format!("failed to create log directory {}: {e}", log_dir.display()),
            })?;
        }

        let file_path = self.service_file_path(name);
        fs::write(&file_path, self.render(desc)).map_err(|e| Error::StoreCorruption {
            message: format!("failed to write service file {}: {e}", file_path.display()),
        })?;
        info!(label = %desc.label, path = %file_path.display(), "wrote service file");

        if let Err(e) = self.daemon_reload() {
            warn!("service manager did not reload: {e}");
        }
        Ok(file_path)
    }

    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let file_path = self.service_file_path(name);
        if !file_path.exists() {
            return Ok(());
        }
        if let Err(e) = self.stop(name) {
            debug!("stop before removal failed: {e}");
        }
        fs::remove_file(&file_path).map_err(|e| Error::StoreCorruption {
            message: format!("failed to remove service file {}: {e}", file_path.display()),
        })?;
        if let Err(e) = self.daemon_reload() {
            warn!("service manager did not reload: {e}");
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ServiceInfo>, Error> {
        if !self.service_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.service_dir).map_err(|e| Error::StoreCorruption {
            message: format!(
                "failed to read service directory {}: {e}",
                self.service_dir.display()
            ),
        })?;

        let mut services = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix(LABEL_PREFIX))
                .and_then(|n| n.strip_suffix(self.format.extension()))
            else {
                continue;
            };
            services.push(ServiceInfo {
                name: name.to_string(),
                status: self.status(name),
                file_path: entry.path(),
            });
        }
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    pub fn status(&self, name: &str) -> ServiceStatus {
        if !self.service_file_path(name).exists() {
            return ServiceStatus::NotInstalled;
        }
        self.query_status(name)
    }

    #[cfg(target_os = "linux")]
    fn query_status(&self, name: &str) -> ServiceStatus {
        let label = service_label(name);
        match Command::new("systemctl")
            .args(["--user", "is-active", &label])
            .output()
        {
            Ok(out) => match String::from_utf8_lossy(&out.stdout).trim() {
                "active" | "activating" => ServiceStatus::Running,
                "inactive" | "dead" => ServiceStatus::Stopped,
                "failed" => ServiceStatus::Error("unit failed".to_string()),
                _ => ServiceStatus::Unknown,
            },
            Err(_) => ServiceStatus::Unknown,
        }
    }

    #[cfg(target_os = "macos")]
    fn query_status(&self, name: &str) -> ServiceStatus {
        let label = service_label(name);
        let Ok(out) = Command::new("launchctl").arg("list").output() else {
            return ServiceStatus::Unknown;
        };
        let stdout = String::from_utf8_lossy(&out.stdout);
        for line in stdout.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if let [pid, exit_status, entry] = parts.as_slice()
                && *entry == label
            {
                return match (*pid, *exit_status) {
                    ("-", "0") => ServiceStatus::Stopped,
                    ("-", code) => ServiceStatus::Error(format!("exited with status {code}")),
                    _ => ServiceStatus::Running,
                };
            }
        }
        ServiceStatus::Stopped
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn query_status(&self, _name: &str) -> ServiceStatus {
        ServiceStatus::Unknown
    }

    #[cfg(target_os = "linux")]
    pub fn start(&self, name: &str) -> Result<(), Error> {
        systemctl(&["start", &service_label(name)], "start service")
    }

    #[cfg(target_os = "macos")]
    pub fn start(&self, name: &str) -> Result<(), Error> {
        let file_path = self.service_file_path(name);
        let output = Command::new("launchctl")
            .args(["load", "-w", &file_path.to_string_lossy()])
            .output()
            .map_err(|e| Error::StoreCorruption {
                message: format!("failed to start service: {e}"),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("already loaded") {
                return Err(Error::StoreCorruption {
                    message: format!("failed to start service: {stderr}"),
                });
            }
        }

        // SAFETY: getuid never fails
        let uid = unsafe { libc::getuid() };
        let _ = Command::new("launchctl")
            .args(["kickstart", "-k", &format!("gui/{uid}/{}", service_label(name))])
            .output();
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub fn start(&self, _name: &str) -> Result<(), Error> {
        Err(Error::StoreCorruption {
            message: "service management not supported on this platform".to_string(),
        })
    }

    #[cfg(target_os = "linux")]
    pub fn stop(&self, name: &str) -> Result<(), Error> {
        systemctl(&["stop", &service_label(name)], "stop service")
    }

    #[cfg(target_os = "macos")]
    pub fn stop(&self, name: &str) -> Result<(), Error> {
        let file_path = self.service_file_path(name);
        let output = Command::new("launchctl")
            .args(["unload", &file_path.to_string_lossy()])
            .output()
            .map_err(|e| Error::StoreCorruption {
                message: format!("failed to stop service: {e}"),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("Could not find") && !stderr.contains("not loaded") {
                return Err(Error::StoreCorruption {
                    message: format!("failed to stop service: {stderr}"),
                });
            }
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub fn stop(&self, _name: &str) -> Result<(), Error> {
        Err(Error::StoreCorruption {
            message: "service management not supported on this platform".to_string(),
        })
    }

    pub fn restart(&self, name: &str) -> Result<(), Error> {
        self.stop(name)?;
        self.start(name)
    }

    #[cfg(target_os = "linux")]
    fn daemon_reload(&self) -> Result<(), Error> {
        systemctl(&["daemon-reload"], "reload daemon")
    }

    #[cfg(not(target_os = "linux"))]
    fn daemon_reload(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn systemctl(args: &[&str], what: &str) -> Result<(), Error> {
    let output = Command::new("systemctl")
        .arg("--user")
        .args(args)
        .output()
        .map_err(|e| Error::StoreCorruption {
            message: format!("failed to {what}: {e}"),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::StoreCorruption {
            message: format!("failed to {what}: {}", stderr.trim()),
        });
    }
    Ok(())
}

/// Render `desc` as a systemd user unit.
pub fn render_systemd(desc: &ServiceDescriptor) -> String {
    let mut exec = systemd_quote(&desc.program.display().to_string());
    for arg in &desc.args {
        exec.push(' ');
        exec.push_str(&systemd_quote(arg));
    }

    let mut unit = format!(
        "[Unit]\nDescription=kegwright: {label}\nAfter=network.target\n\n\
         [Service]\nType=simple\nExecStart={exec}\nWorkingDirectory={wd}\n",
        label = desc.label,
        wd = desc.working_directory.display(),
    );
    for (key, value) in &desc.environment {
        unit.push_str(&format!(
            "Environment={}\n",
            systemd_quote(&format!("{key}={value}"))
        ));
    }
    match desc.restart {
        RestartPolicy::KeepAlive => unit.push_str("Restart=always\nRestartSec=3\n"),
        RestartPolicy::Manual => unit.push_str("Restart=no\n"),
    }
    unit.push_str(&format!(
        "StandardOutput=append:{}\nStandardError=append:{}\n",
        desc.stdout_log.display(),
        desc.stderr_log.display()
    ));

    unit.push_str("\n[Install]\n");
    if desc.run_at_load {
        unit.push_str("WantedBy=default.target\n");
    }
    unit
}

fn systemd_quote(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%")
        .replace('$', "$$");
    if escaped.is_empty() || escaped.contains(char::is_whitespace) || escaped != value {
        format!("\"{escaped}\"")
    } else {
        escaped
    }
}

/// Render `desc` as a launchd property list.
pub fn render_launchd(desc: &ServiceDescriptor) -> String {
    let mut plist = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n<dict>\n",
    );
    let key_string = |plist: &mut String, key: &str, value: &str| {
        plist.push_str(&format!(
            "    <key>{key}</key>\n    <string>{}</string>\n",
            xml_escape(value)
        ));
    };

    key_string(&mut plist, "Label", &desc.label);
    plist.push_str("    <key>ProgramArguments</key>\n    <array>\n");
    plist.push_str(&format!(
        "        <string>{}</string>\n",
        xml_escape(&desc.program.display().to_string())
    ));
    for arg in &desc.args {
        plist.push_str(&format!("        <string>{}</string>\n", xml_escape(arg)));
    }
    plist.push_str("    </array>\n");

    key_string(
        &mut plist,
        "WorkingDirectory",
        &desc.working_directory.display().to_string(),
    );
    if !desc.environment.is_empty() {
        plist.push_str("    <key>EnvironmentVariables</key>\n    <dict>\n");
        for (key, value) in &desc.environment {
            plist.push_str(&format!(
                "        <key>{}</key>\n        <string>{}</string>\n",
                xml_escape(key),
                xml_escape(value)
            ));
        }
        plist.push_str("    </dict>\n");
    }

    let flag = |on: bool| if on { "<true/>" } else { "<false/>" };
    plist.push_str(&format!(
        "    <key>RunAtLoad</key>\n    {}\n",
        flag(desc.run_at_load)
    ));
    plist.push_str(&format!(
        "    <key>KeepAlive</key>\n    {}\n",
        flag(desc.restart == RestartPolicy::KeepAlive)
    ));
    key_string(
        &mut plist,
        "StandardOutPath",
        &desc.stdout_log.display().to_string(),
    );
    key_string(
        &mut plist,
        "StandardErrorPath",
        &desc.stderr_log.display().to_string(),
    );

    plist.push_str("</dict>\n</plist>\n");
    plist
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
