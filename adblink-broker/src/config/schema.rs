//! Configuration schema structs

use serde::{Deserialize, Serialize};

/// Agent library attached when none is configured
pub const DEFAULT_AGENT_NAME: &str = "libjdwp.so";

/// Name given to the worker thread
pub const DEFAULT_THREAD_NAME: &str = "adblink-worker";

/// Root configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Agent identity used as the prefix of the attach argument string
    pub agent_name: String,
    /// Raw agent options supplied by the runtime
    pub jdwp_options: String,
    pub process: ProcessConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            agent_name: DEFAULT_AGENT_NAME.into(),
            jdwp_options: String::new(),
            process: ProcessConfig::default(),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Facts about the host process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Whether a debugger may attach to this process
    pub debuggable: bool,
    /// Whether the process is profileable from the shell
    pub profileable: bool,
    /// Instruction set name reported to the bridge
    pub architecture: String,
    /// Used to relocate a relative agent `logfile`
    pub package_name: Option<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            debuggable: false,
            profileable: false,
            architecture: std::env::consts::ARCH.into(),
            package_name: None,
        }
    }
}

/// Bridge registration retry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First delay after a failed connect (default: 500)
    pub initial_delay_ms: u64,
    /// Upper bound on the delay (default: 2000)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 2000,
        }
    }
}

/// Worker thread settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_THREAD_NAME.into(),
        }
    }
}
