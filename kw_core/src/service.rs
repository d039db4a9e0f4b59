//! Service descriptors.
//!
//! The descriptor is a pure function of the resolved layout; registering it
//! with launchd or systemd is the job of `kw_io::services`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::layout::InstallLayout;
use crate::package::ServiceSpec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Started on demand, never restarted by the service manager
    Manual,
    KeepAlive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub restart: RestartPolicy,
    pub run_at_load: bool,
}

pub fn service_label(name: &str) -> String {
    format!("kegwright.{name}")
}

/// Build the descriptor for `layout`.
pub fn generate(layout: &InstallLayout, spec: &ServiceSpec) -> Result<ServiceDescriptor, Error> {
    let vars = layout.vars();
    let log_name = spec.log_name.as_deref().unwrap_or(&layout.name);
    let log = layout.runtime.logs.join(format!("{log_name}.log"));

    Ok(ServiceDescriptor {
        label: service_label(&layout.name),
        program: layout.opt_bin(&spec.program),
        args: vars.expand_all(&spec.args)?,
        working_directory: layout.runtime.root.clone(),
        environment: vars.expand_map(&spec.env)?,
        stdout_log: log.clone(),
        stderr_log: log,
        restart: if spec.keep_alive {
            RestartPolicy::KeepAlive
        } else {
            RestartPolicy::Manual
        },
        run_at_load: spec.run_at_load,
    })
}
