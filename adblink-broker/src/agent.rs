//! Attaching the debugging agent
//!
//! The agent is loaded lazily, the first time the debugger sends a packet
//! the broker cannot answer itself. It is handed an argument string of the
//! form `<agent>=k=v,k=v,...` that points it at the control channel and
//! forces the options this connection model depends on.

use std::os::fd::RawFd;

use tracing::{debug, error};

use adblink_utils::{AdblinkError, Result};

/// Transport the agent must use to receive the handed-off connection
pub const AGENT_TRANSPORT: &str = "dt_fd_forward";

const LOGFILE_KEY: &str = "logfile";

/// Loads the agent into the process
pub trait AgentAttacher: Send + Sync {
    /// Attach the agent with the given argument string
    fn attach(&self, args: &str) -> Result<()>;
}

/// Reject raw options this connection model cannot honour
///
/// `server=n` would leave the worker waiting on descriptors that never get
/// used; `suspend=y` is meaningless once threads are already running.
pub fn validate_agent_options(raw: &str) -> Result<()> {
    let mut rejected = Vec::new();

    if raw.contains("server=n") {
        error!("Cannot start jdwp debugging with server=n");
        rejected.push("server=n");
    }
    if raw.contains("suspend=y") {
        error!("Cannot use suspend=y with late-init jdwp");
        rejected.push("suspend=y");
    }

    if rejected.is_empty() {
        Ok(())
    } else {
        Err(AdblinkError::InvalidAgentOptions(rejected.join(", ")))
    }
}

/// Ordered `key=value` option list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentArgs {
    entries: Vec<(String, String)>,
}

impl AgentArgs {
    /// Parse `k=v,k=v`; entries without `=` are skipped
    pub fn parse(raw: &str) -> Self {
        let mut args = Self::default();
        for option in raw.split(',').filter(|o| !o.is_empty()) {
            match option.split_once('=') {
                Some((key, value)) => args.put(key, value),
                None => debug!(option, "Skipping agent option without value"),
            }
        }
        args
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replace in place, or append if new
    pub fn put(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn join(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Point a relative `logfile` at the app's data directory
///
/// Apps cannot write to their working directory. Absolute paths, and
/// relative ones with no known package, are left alone.
pub fn fix_logfile(args: &mut AgentArgs, package_name: Option<&str>) {
    let Some(logfile) = args.get(LOGFILE_KEY) else {
        return;
    };
    if logfile.starts_with('/') {
        return;
    }
    match package_name.filter(|p| !p.is_empty()) {
        Some(package) => {
            let fixed = format!("/data/data/{}/{}", package, logfile);
            args.put(LOGFILE_KEY, fixed);
        }
        None => debug!(logfile, "Unable to fix relative logfile without package name"),
    }
}

/// Inputs for building the attach argument string
#[derive(Debug, Clone)]
pub struct AgentLaunch {
    pub agent_name: String,
    pub raw_options: String,
    pub package_name: Option<String>,
}

impl AgentLaunch {
    /// Build `<agent>=k=v,...` with the forced overrides applied
    pub fn build_args(&self, ddm_already_active: bool, control_fd: RawFd) -> String {
        debug!(raw = %self.raw_options, "Raw agent options");
        let mut args = AgentArgs::parse(&self.raw_options);

        args.put("server", "y");
        args.put("suspend", "n");
        args.put(
            "ddm_already_active",
            if ddm_already_active { "y" } else { "n" },
        );
        args.put("transport", AGENT_TRANSPORT);
        args.put("address", control_fd.to_string());

        fix_logfile(&mut args, self.package_name.as_deref());

        format!("{}={}", self.agent_name, args.join())
    }
}
