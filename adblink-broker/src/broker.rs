//! Connection broker lifecycle
//!
//! [`ConnectionBroker`] owns the worker thread. `start` creates the shared
//! write lock and the agent control pair, then spawns the worker; `stop`
//! cancels it and joins. DDM chunks may be published from any thread while
//! the worker runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use adblink_protocol::{fourcc, DdmPacket, PacketKind};
use adblink_utils::{AdblinkError, Result};

use crate::agent::{AgentAttacher, AgentLaunch};
use crate::bridge::{BridgeConnector, ProcessInfo};
use crate::config::BrokerConfig;
use crate::connection::{SendOutcome, SharedConnection};
use crate::control::ControlPair;
use crate::ddm::DdmHandler;
use crate::event_loop::{run_worker, WorkerContext};
use crate::fd_lock::FdLock;

/// Bit set on every id the broker allocates for its own packets
pub const BROKER_PACKET_ID_FLAG: u32 = 0x8000_0000;

/// Host services the broker talks to
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn BridgeConnector>,
    pub attacher: Arc<dyn AgentAttacher>,
    pub ddm: Arc<dyn DdmHandler>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct WorkerHandle {
    cancel: CancellationToken,
    thread: JoinHandle<()>,
    shared: Arc<SharedConnection>,
}

/// Routes debugger connections between the runtime and the agent
#[derive(Debug)]
pub struct ConnectionBroker {
    config: BrokerConfig,
    process: ProcessInfo,
    collaborators: Collaborators,
    worker: Mutex<Option<WorkerHandle>>,
    next_id: AtomicU32,
}

impl ConnectionBroker {
    pub fn new(config: BrokerConfig, collaborators: Collaborators) -> Self {
        let process = ProcessInfo::current(&config.process);
        Self {
            config,
            process,
            collaborators,
            worker: Mutex::new(None),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Spawn the worker thread
    ///
    /// Fails with [`AdblinkError::AlreadyStarted`] if a worker is running.
    /// On any other failure nothing is left running and the process simply
    /// remains undebuggable.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(AdblinkError::AlreadyStarted);
        }

        let write_lock = FdLock::new()
            .map_err(|e| AdblinkError::setup(format!("failed to create write lock: {}", e)))?;
        let control = ControlPair::create().map_err(|e| {
            AdblinkError::setup(format!("failed to create control socket pair: {}", e))
        })?;

        let shared = Arc::new(SharedConnection::new(write_lock));
        let cancel = CancellationToken::new();
        let ctx = WorkerContext {
            shared: Arc::clone(&shared),
            collaborators: self.collaborators.clone(),
            process: self.process.clone(),
            launch: AgentLaunch {
                agent_name: self.config.agent_name.clone(),
                raw_options: self.config.jdwp_options.clone(),
                package_name: self.config.process.package_name.clone(),
            },
            retry: self.config.retry.clone(),
            cancel: cancel.clone(),
            control,
        };

        let thread = std::thread::Builder::new()
            .name(self.config.worker.thread_name.clone())
            .spawn(move || run_worker(ctx))
            .map_err(|e| AdblinkError::setup(format!("failed to spawn worker thread: {}", e)))?;

        info!(thread = %self.config.worker.thread_name, "Connection broker started");
        *worker = Some(WorkerHandle {
            cancel,
            thread,
            shared,
        });
        Ok(())
    }

    /// Cancel the worker and wait for it to exit; no-op when not running
    pub fn stop(&self) {
        let Some(handle) = self.worker.lock().take() else {
            debug!("Stop requested but broker is not running");
            return;
        };

        handle.cancel.cancel();
        if handle.thread.join().is_err() {
            error!("Debugger worker thread panicked");
        }
        info!("Connection broker stopped");
    }

    /// Send an unsolicited DDM chunk to the connected debugger
    ///
    /// Dropped silently if nobody connected has finished the handshake.
    pub fn publish_chunk(&self, chunk_type: u32, payload: &[u8]) -> SendOutcome {
        let shared = match self.worker.lock().as_ref() {
            Some(handle) => Arc::clone(&handle.shared),
            None => {
                trace!(chunk = %fourcc(chunk_type), "Not sending DDM chunk: broker stopped");
                return SendOutcome::Dropped;
            }
        };

        let packet = DdmPacket {
            id: self.allocate_id(),
            kind: PacketKind::Command,
            chunk_type,
            payload: Bytes::copy_from_slice(payload),
        };
        match shared.send_packet(&packet) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Failed to lock debugger socket for DDM chunk");
                SendOutcome::Dropped
            }
        }
    }

    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) | BROKER_PACKET_ID_FLAG
    }
}

impl Drop for ConnectionBroker {
    fn drop(&mut self) {
        self.stop();
    }
}
