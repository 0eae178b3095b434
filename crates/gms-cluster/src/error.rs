//! Membership error types

use std::net::AddrParseError;

/// Result type for membership operations
pub type Result<T> = std::result::Result<T, MembershipError>;

/// Membership-specific error types
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown message type: dsfid {0:#06x}")]
    UnknownMessageType(u32),

    #[error("{kind} requires protocol version {required} but peer speaks {peer}")]
    UnsupportedVersion {
        kind: &'static str,
        required: u16,
        peer: u16,
    },

    #[error("Stale view number {received} (installed {installed})")]
    StaleViewNumber { received: u64, installed: u64 },

    #[error("View number gap: received {received} while installed {installed}")]
    ViewNumberGap { received: u64, installed: u64 },

    #[error("View change would leave no members")]
    EmptyView,

    #[error("No member of the view is eligible to coordinate")]
    NoEligibleCoordinator,

    #[error("Acknowledgment timeout for view {view_number}: {pending} members did not respond")]
    AckTimeout { view_number: u64, pending: usize },

    #[error("Service loading failure: {0}")]
    ServiceLoading(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Member {0} has been removed from the cluster and may not rejoin")]
    Shunned(String),

    #[error("Join rejected: {0}")]
    JoinRejected(String),

    #[error("Timed out joining the cluster after {0:?}")]
    JoinTimeout(std::time::Duration),

    #[error("Forced disconnect: {0}")]
    ForcedDisconnect(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Membership service is not running")]
    NotRunning,

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] AddrParseError),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl MembershipError {
    pub fn malformed<T: Into<String>>(msg: T) -> Self {
        Self::MalformedMessage(msg.into())
    }

    pub fn service_loading<T: Into<String>>(msg: T) -> Self {
        Self::ServiceLoading(msg.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn join_rejected<T: Into<String>>(msg: T) -> Self {
        Self::JoinRejected(msg.into())
    }

    pub fn forced_disconnect<T: Into<String>>(msg: T) -> Self {
        Self::ForcedDisconnect(msg.into())
    }

    pub fn authentication<T: Into<String>>(msg: T) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn transport<T: Into<String>>(msg: T) -> Self {
        Self::Transport(msg.into())
    }

    pub fn member_not_found<T: Into<String>>(member: T) -> Self {
        Self::MemberNotFound(member.into())
    }

    /// Errors after which the local process must stop participating in the
    /// cluster.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoEligibleCoordinator | Self::ForcedDisconnect(_) | Self::ServiceLoading(_)
        )
    }

    /// Codec-level errors: the offending message is dropped, the connection
    /// stays up.
    pub fn is_codec_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage(_) | Self::UnknownMessageType(_) | Self::UnsupportedVersion { .. }
        )
    }
}
