//! adblink-broker: debugger connection broker for a managed runtime
//!
//! Registers the process with the host-side bridge daemon, answers DDM
//! traffic directly while it can, and attaches the full JDWP agent (handing
//! it the live connection) once a debugger needs more than DDM.

pub mod agent;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod connection;
pub mod control;
pub mod controller;
pub mod ddm;
mod event_loop;
pub mod fd_lock;
pub mod state;
pub mod sys;

pub use agent::{validate_agent_options, AgentArgs, AgentAttacher, AgentLaunch};
pub use bridge::{BridgeClient, BridgeConnector, ProcessInfo};
pub use broker::{Collaborators, ConnectionBroker};
pub use config::{BrokerConfig, ConfigLoader};
pub use connection::SendOutcome;
pub use controller::{initialize, DdmCallback, DebuggerController};
pub use ddm::{DdmHandler, DdmReply};
