//! Entry points the runtime calls
//!
//! The host process builds one broker with [`initialize`] during startup
//! and hands clones of the adapters below to whatever raises lifecycle and
//! DDM events. Dropping the last reference to the broker tears it down.

use std::sync::Arc;

use tracing::{debug, error, info};

use adblink_utils::{AdblinkError, Result};

use crate::broker::{Collaborators, ConnectionBroker};
use crate::config::{BrokerConfig, ConfigLoader};
use crate::connection::SendOutcome;

/// Validate the configuration and construct the broker
///
/// Nothing is spawned until [`DebuggerController::start_debugger`].
pub fn initialize(
    config: BrokerConfig,
    collaborators: Collaborators,
) -> Result<Arc<ConnectionBroker>> {
    ConfigLoader::validate(&config)?;
    debug!(agent = %config.agent_name, "Debugger broker initialized");
    Ok(Arc::new(ConnectionBroker::new(config, collaborators)))
}

/// Process lifecycle hooks
#[derive(Clone)]
pub struct DebuggerController {
    broker: Arc<ConnectionBroker>,
}

impl DebuggerController {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Self { broker }
    }

    /// Start accepting debugger connections if this process allows it
    pub fn start_debugger(&self) {
        let process = self.broker.process();
        if !process.debuggable && !process.profileable {
            error!("Not starting debugger since process cannot load the jdwp agent");
            return;
        }

        match self.broker.start() {
            Ok(()) => {}
            Err(AdblinkError::AlreadyStarted) => debug!("Debugger already started"),
            Err(e) if e.is_fatal_to_feature() => error!(error = %e, "Debugging disabled"),
            Err(e) => error!(error = %e, "Failed to start debugger"),
        }
    }

    pub fn stop_debugger(&self) {
        self.broker.stop();
    }

    /// Whether a full debugger could be attached to this process
    pub fn is_debugger_configured(&self) -> bool {
        let config = self.broker.config();
        config.process.debuggable && !config.jdwp_options.is_empty()
    }
}

/// DDM publisher used by runtime telemetry hooks
#[derive(Clone)]
pub struct DdmCallback {
    broker: Arc<ConnectionBroker>,
}

impl DdmCallback {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Self { broker }
    }

    pub fn ddm_publish_chunk(&self, chunk_type: u32, data: &[u8]) {
        if let SendOutcome::Short { written, expected } =
            self.broker.publish_chunk(chunk_type, data)
        {
            info!(written, expected, "DDM chunk only partially delivered");
        }
    }
}
