//! Error types for adblink
//!
//! Provides a unified error type used across all adblink crates.

use std::path::PathBuf;

/// Main error type for adblink operations
#[derive(Debug, thiserror::Error)]
pub enum AdblinkError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Setup Errors ===

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Debugger worker already started")]
    AlreadyStarted,

    // === Bridge Errors ===

    #[error("Bridge registration failed: {0}")]
    Bridge(String),

    // === Agent Errors ===

    #[error("Failed to attach agent {agent}: {message}")]
    AgentAttach { agent: String, message: String },

    #[error("Unsupported agent options: {0}")]
    InvalidAgentOptions(String),

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AdblinkError {
    /// Create a setup error
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    /// Create a bridge error
    pub fn bridge(msg: impl Into<String>) -> Self {
        Self::Bridge(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an agent attach error
    pub fn agent_attach(agent: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::AgentAttach {
            agent: agent.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    ///
    /// Transient environment failures are retried with backoff and never
    /// surfaced; everything else either resets the connection or disables
    /// the debugging feature.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Bridge(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if this error disables the debugging feature for the process
    pub fn is_fatal_to_feature(&self) -> bool {
        matches!(
            self,
            Self::Setup(_) | Self::InvalidAgentOptions(_) | Self::AlreadyStarted
        )
    }
}

/// Result type alias using AdblinkError
pub type Result<T> = std::result::Result<T, AdblinkError>;
