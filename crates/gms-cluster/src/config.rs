//! Membership service configuration

use crate::error::{MembershipError, Result};
use crate::failure_detector::SuspicionPolicy;
use crate::member::{MemberIdentifier, MemberRole};
use crate::message::ProtocolVersion;
use crate::registry::{AuthenticatorRegistry, CodecRegistry};
use crate::view_manager::InstallationPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Name of this member
    pub member_name: String,

    /// Name of the cluster, used in logs
    pub cluster_name: String,

    /// Address this member binds to
    pub bind_address: SocketAddr,

    /// Address peers use to reach this member, when different from the bind
    /// address
    pub advertise_address: Option<SocketAddr>,

    pub role: MemberRole,

    /// Whether this member founds the cluster instead of joining it
    pub is_initial_member: bool,

    /// Members contacted when joining
    pub locators: Vec<SocketAddr>,

    pub heartbeat_interval: Duration,

    pub suspicion: SuspicionPolicy,

    pub installation: InstallationPolicy,

    /// Give up joining after this long
    pub join_timeout: Duration,

    /// Resend the join request this often while joining
    pub join_retry_interval: Duration,

    /// Stop waiting for the departure view after this long
    pub leave_timeout: Duration,

    /// Authenticator id, see [`AuthenticatorRegistry`]
    pub authentication_mode: String,

    /// Secret for the `SHARED_SECRET` authenticator
    pub shared_secret: Option<String>,

    /// Codec id, see [`CodecRegistry`]
    pub wire_protocol: String,

    /// Newest layout this member speaks
    pub protocol_version: ProtocolVersion,

    /// Capacity of the internal event queues
    pub queue_capacity: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            member_name: format!("member-{}", uuid::Uuid::new_v4()),
            cluster_name: "gms-cluster".to_string(),
            bind_address: SocketAddr::from(([127, 0, 0, 1], 7800)),
            advertise_address: None,
            role: MemberRole::Server,
            is_initial_member: false,
            locators: vec![],
            heartbeat_interval: Duration::from_secs(1),
            suspicion: SuspicionPolicy::default(),
            installation: InstallationPolicy::default(),
            join_timeout: Duration::from_secs(30),
            join_retry_interval: Duration::from_secs(1),
            leave_timeout: Duration::from_secs(5),
            authentication_mode: AuthenticatorRegistry::NOOP.to_string(),
            shared_secret: None,
            wire_protocol: CodecRegistry::BINARY.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
            queue_capacity: 1024,
        }
    }
}

impl MembershipConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MembershipError::configuration(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content).map_err(|e| MembershipError::configuration(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| MembershipError::configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| MembershipError::configuration(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.member_name.is_empty() {
            return Err(MembershipError::configuration("Member name cannot be empty"));
        }

        if self.cluster_name.is_empty() {
            return Err(MembershipError::configuration("Cluster name cannot be empty"));
        }

        if !self.is_initial_member && self.locators.is_empty() {
            return Err(MembershipError::configuration(
                "Non-initial members must have locators configured",
            ));
        }

        if self.is_initial_member && self.role.coordinator_rank().is_none() {
            return Err(MembershipError::configuration(format!(
                "A {} cannot found a cluster",
                self.role
            )));
        }

        if self.heartbeat_interval < Duration::from_millis(10) {
            return Err(MembershipError::configuration("Heartbeat interval must be at least 10ms"));
        }

        if self.suspicion.missed_heartbeats == 0 {
            return Err(MembershipError::configuration("Missed heartbeat threshold must be at least 1"));
        }

        if self.installation.max_attempts == 0 {
            return Err(MembershipError::configuration("Installation needs at least one attempt"));
        }

        if self.installation.ack_timeout.is_zero() {
            return Err(MembershipError::configuration("Ack timeout must be positive"));
        }

        if self.installation.max_backoff < self.installation.ack_timeout {
            return Err(MembershipError::configuration(
                "Maximum backoff must not be shorter than the ack timeout",
            ));
        }

        if self.join_timeout < self.join_retry_interval {
            return Err(MembershipError::configuration(
                "Join timeout must not be shorter than the join retry interval",
            ));
        }

        if self.queue_capacity == 0 {
            return Err(MembershipError::configuration("Queue capacity must be positive"));
        }

        Ok(())
    }

    /// Address announced to peers
    pub fn advertised_address(&self) -> SocketAddr {
        self.advertise_address.unwrap_or(self.bind_address)
    }

    /// Identity of this process; every call yields a new start time
    pub fn local_member(&self) -> MemberIdentifier {
        MemberIdentifier::new(self.advertised_address())
            .with_name(self.member_name.clone())
            .with_role(self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = MembershipConfig::default();
        assert!(config.member_name.starts_with("member-"));
        assert_eq!(config.cluster_name, "gms-cluster");
        assert_eq!(config.authentication_mode, "NOOP");
        assert_eq!(config.wire_protocol, "binary");
        assert_eq!(config.protocol_version, ProtocolVersion::CURRENT);
        assert!(!config.is_initial_member);
    }

    #[test]
    fn test_config_validation() {
        let mut config = MembershipConfig::default();

        // Valid config
        config.is_initial_member = true;
        assert!(config.validate().is_ok());

        // Invalid: empty member name
        config.member_name = String::new();
        assert!(config.validate().is_err());

        // Invalid: joining member without locators
        config.member_name = "test".to_string();
        config.is_initial_member = false;
        assert!(config.validate().is_err());

        config.locators = vec![SocketAddr::from(([127, 0, 0, 1], 7801))];
        assert!(config.validate().is_ok());

        // Invalid: observers cannot found a cluster
        config.is_initial_member = true;
        config.role = MemberRole::Observer;
        assert!(matches!(config.validate(), Err(MembershipError::Configuration(_))));
    }

    #[test]
    fn test_installation_limits() {
        let mut config = MembershipConfig {
            is_initial_member: true,
            ..Default::default()
        };
        config.installation.max_attempts = 0;
        assert!(config.validate().is_err());

        config.installation.max_attempts = 2;
        config.installation.max_backoff = Duration::from_millis(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_member() {
        let config = MembershipConfig {
            member_name: "cache-1".into(),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 7800)),
            advertise_address: Some(SocketAddr::from(([10, 0, 0, 5], 7800))),
            role: MemberRole::Locator,
            ..Default::default()
        };

        let member = config.local_member();
        assert_eq!(member.name(), Some("cache-1"));
        assert_eq!(member.role(), MemberRole::Locator);
        assert_eq!(member.socket_addr(), SocketAddr::from(([10, 0, 0, 5], 7800)));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: MembershipConfig = toml::from_str(
            r#"
            member_name = "cache-2"
            locators = ["10.0.0.5:7800"]
            wire_protocol = "json"
            protocol_version = "1.0"
            "#,
        )
        .unwrap();

        assert_eq!(config.member_name, "cache-2");
        assert_eq!(config.wire_protocol, "json");
        assert_eq!(config.protocol_version, ProtocolVersion::V1_0);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("membership.toml");

        let config = MembershipConfig {
            shared_secret: Some("s3cret".into()),
            authentication_mode: AuthenticatorRegistry::SHARED_SECRET.into(),
            ..Default::default()
        };

        // Save to file
        config.to_file(&config_path).unwrap();
        assert!(config_path.exists());

        // Load from file
        let loaded = MembershipConfig::from_file(&config_path).unwrap();
        assert_eq!(config.member_name, loaded.member_name);
        assert_eq!(config.bind_address, loaded.bind_address);
        assert_eq!(config.shared_secret, loaded.shared_secret);
        assert_eq!(config.installation, loaded.installation);
        assert_eq!(config.suspicion, loaded.suspicion);
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = tempdir().unwrap();
        let result = MembershipConfig::from_file(temp_dir.path().join("absent.toml"));
        assert!(matches!(result, Err(MembershipError::Configuration(_))));
    }
}
