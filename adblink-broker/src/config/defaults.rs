//! Default configuration values
//!
//! These are embedded in the binary and used when no config file exists.

/// Default configuration as TOML (for reference/documentation)
pub const DEFAULT_CONFIG_TOML: &str = r##"
# adblink configuration

# Agent library attached when a debugger needs more than DDM
agent_name = "libjdwp.so"

# Raw agent options from the runtime, e.g. "logfile=jdwp.log"
jdwp_options = ""

[process]
debuggable = false
profileable = false
# architecture = "arm64"
# package_name = "com.example.app"

[retry]
initial_delay_ms = 500
max_delay_ms = 2000

[worker]
thread_name = "adblink-worker"
"##;
