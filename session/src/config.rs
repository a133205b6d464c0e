//! Static configuration supplied by the surrounding application

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use shared::{
    NetworkSessionProperties, NetworkSessionType, DEFAULT_SESSION_PORT, MAX_LOCAL_GAMERS,
};
use std::net::SocketAddr;
use std::time::Duration;

/// What to do with a `User` message whose recipient gamer is not local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownRecipientPolicy {
    /// Always a protocol violation
    Reject,
    /// Accept silently if the id belonged to a gamer that has since left
    #[default]
    AcceptIfDeparted,
    /// Accept silently no matter what
    AcceptAll,
}

/// Engine-wide settings that do not travel over the wire.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Application identifier; joins and searches only see matching hosts
    pub app_id: String,
    /// Port hosts listen on and LAN discovery probes
    pub port: u16,
    pub master_server: Option<SocketAddr>,
    /// How often an advertised host re-registers with the master server
    pub registration_interval: Duration,
    pub join_timeout: Duration,
    pub discovery_timeout: Duration,
    /// Sleep between polls in the join/find loops
    pub poll_interval: Duration,
    pub max_delayed_packets_per_sender: usize,
    pub unknown_recipient_policy: UnknownRecipientPolicy,
    /// Host disconnects a machine on its first protocol violation
    pub kick_on_protocol_violation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app_id: "netsession".to_string(),
            port: DEFAULT_SESSION_PORT,
            master_server: None,
            registration_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(4),
            discovery_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            max_delayed_packets_per_sender: 32,
            unknown_recipient_policy: UnknownRecipientPolicy::default(),
            kick_on_protocol_violation: false,
        }
    }
}

impl SessionConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_master_server(mut self, addr: SocketAddr) -> Self {
        self.master_server = Some(addr);
        self
    }

    pub fn with_registration_interval(mut self, interval: Duration) -> Self {
        self.registration_interval = interval;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_delayed_packets(mut self, max: usize) -> Self {
        self.max_delayed_packets_per_sender = max;
        self
    }

    pub fn with_unknown_recipient_policy(mut self, policy: UnknownRecipientPolicy) -> Self {
        self.unknown_recipient_policy = policy;
        self
    }

    pub fn with_kick_on_protocol_violation(mut self, kick: bool) -> Self {
        self.kick_on_protocol_violation = kick;
        self
    }
}

/// Shape of a session, fixed by the host at create time and handed to every
/// joining machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub session_type: NetworkSessionType,
    pub max_gamers: u8,
    pub private_gamer_slots: u8,
    pub allow_join_in_progress: bool,
    pub properties: NetworkSessionProperties,
}

impl SessionSettings {
    pub fn new(session_type: NetworkSessionType, max_gamers: u8) -> Self {
        Self {
            session_type,
            max_gamers,
            private_gamer_slots: 0,
            allow_join_in_progress: false,
            properties: NetworkSessionProperties::default(),
        }
    }

    pub fn with_private_slots(mut self, slots: u8) -> Self {
        self.private_gamer_slots = slots;
        self
    }

    pub fn with_join_in_progress(mut self, allow: bool) -> Self {
        self.allow_join_in_progress = allow;
        self
    }

    pub fn with_properties(mut self, properties: NetworkSessionProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn validate(&self, local_gamers: usize) -> Result<(), SessionError> {
        if self.max_gamers < 1 {
            return Err(SessionError::InvalidSettings(
                "a session needs room for at least one gamer".to_string(),
            ));
        }
        if self.private_gamer_slots > self.max_gamers {
            return Err(SessionError::InvalidSettings(format!(
                "{} private slots exceed {} max gamers",
                self.private_gamer_slots, self.max_gamers
            )));
        }
        if local_gamers == 0 || local_gamers > MAX_LOCAL_GAMERS {
            return Err(SessionError::InvalidSettings(format!(
                "between 1 and {} local gamers required, got {}",
                MAX_LOCAL_GAMERS, local_gamers
            )));
        }
        if local_gamers > self.max_gamers as usize {
            return Err(SessionError::InvalidSettings(format!(
                "{} local gamers do not fit into {} max gamers",
                local_gamers, self.max_gamers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.port, DEFAULT_SESSION_PORT);
        assert_eq!(config.max_delayed_packets_per_sender, 32);
        assert_eq!(
            config.unknown_recipient_policy,
            UnknownRecipientPolicy::AcceptIfDeparted
        );
        assert!(!config.kick_on_protocol_violation);
        assert!(config.master_server.is_none());
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::new("racer")
            .with_port(4000)
            .with_max_delayed_packets(4)
            .with_join_timeout(Duration::from_millis(250));
        assert_eq!(config.app_id, "racer");
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_delayed_packets_per_sender, 4);
        assert_eq!(config.join_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_settings_validation() {
        let settings = SessionSettings::new(NetworkSessionType::SystemLink, 4);
        assert!(settings.validate(1).is_ok());
        assert!(settings.validate(0).is_err());
        assert!(settings.validate(MAX_LOCAL_GAMERS + 1).is_err());

        let too_private = SessionSettings::new(NetworkSessionType::SystemLink, 4).with_private_slots(5);
        assert!(too_private.validate(1).is_err());

        let tiny = SessionSettings::new(NetworkSessionType::Local, 1);
        assert!(tiny.validate(2).is_err());
        assert!(SessionSettings::new(NetworkSessionType::Local, 0).validate(1).is_err());
    }
}
