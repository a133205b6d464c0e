//! Bookkeeping of the hosts currently advertised through the master server
//!
//! Hosts are keyed by application id and session guid. A host stays listed as
//! long as it keeps re-registering within the expiry window, and only the
//! endpoint that registered a session may refresh or withdraw it.

use log::{info, warn};
use shared::{HostEntry, NetworkSessionPublicInfo, SessionGuid};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One advertised session and when it was last refreshed
#[derive(Debug, Clone)]
pub struct RegisteredHost {
    pub app_id: String,
    pub entry: HostEntry,
    pub last_seen: Instant,
}

impl RegisteredHost {
    pub fn is_expired(&self, expiry: Duration) -> bool {
        self.last_seen.elapsed() > expiry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Added,
    Refreshed,
    /// The registry is at capacity
    Full,
    /// The guid is registered from another endpoint
    Conflict,
}

pub struct HostRegistry {
    hosts: HashMap<(String, SessionGuid), RegisteredHost>,
    max_hosts: usize,
    expiry: Duration,
}

impl HostRegistry {
    pub fn new(max_hosts: usize, expiry: Duration) -> Self {
        Self {
            hosts: HashMap::new(),
            max_hosts,
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Adds or refreshes the registration of `guid` sent from `external`.
    pub fn upsert(
        &mut self,
        app_id: &str,
        guid: SessionGuid,
        internal: SocketAddr,
        external: SocketAddr,
        info: NetworkSessionPublicInfo,
    ) -> RegisterOutcome {
        let key = (app_id.to_string(), guid);
        if let Some(host) = self.hosts.get_mut(&key) {
            if host.entry.external != external {
                warn!(
                    "Session {} registered from {} cannot be refreshed from {}",
                    guid, host.entry.external, external
                );
                return RegisterOutcome::Conflict;
            }
            host.entry.internal = internal;
            host.entry.info = info;
            host.last_seen = Instant::now();
            return RegisterOutcome::Refreshed;
        }

        if self.hosts.len() >= self.max_hosts {
            warn!("Host registry full, ignoring session {} from {}", guid, external);
            return RegisterOutcome::Full;
        }
        info!("Registered {} session {} at {} ({})", app_id, guid, external, internal);
        self.hosts.insert(
            key,
            RegisteredHost {
                app_id: app_id.to_string(),
                entry: HostEntry {
                    guid,
                    internal,
                    external,
                    info,
                },
                last_seen: Instant::now(),
            },
        );
        RegisterOutcome::Added
    }

    /// Withdraws a registration. Only the registering endpoint may do so.
    pub fn unregister(&mut self, app_id: &str, guid: SessionGuid, from: SocketAddr) -> bool {
        let key = (app_id.to_string(), guid);
        match self.hosts.get(&key) {
            Some(host) if host.entry.external == from => {
                self.hosts.remove(&key);
                info!("Unregistered session {} at {}", guid, from);
                true
            }
            Some(_) => {
                warn!("Ignoring unregister of session {} from {}", guid, from);
                false
            }
            None => false,
        }
    }

    pub fn get(&self, app_id: &str, guid: SessionGuid) -> Option<&HostEntry> {
        self.hosts
            .get(&(app_id.to_string(), guid))
            .map(|host| &host.entry)
    }

    /// Every live host of `app_id`, oldest guid first for a stable order
    pub fn hosts_for(&self, app_id: &str) -> Vec<HostEntry> {
        let mut hosts: Vec<HostEntry> = self
            .hosts
            .values()
            .filter(|host| host.app_id == app_id && !host.is_expired(self.expiry))
            .map(|host| host.entry.clone())
            .collect();
        hosts.sort_by_key(|entry| entry.guid.0);
        hosts
    }

    /// Drops hosts that stopped re-registering. Returns their guids.
    pub fn expire(&mut self) -> Vec<SessionGuid> {
        let expiry = self.expiry;
        let expired: Vec<(String, SessionGuid)> = self
            .hosts
            .iter()
            .filter(|(_, host)| host.is_expired(expiry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(host) = self.hosts.remove(key) {
                info!("Session {} at {} expired", host.entry.guid, host.entry.external);
            }
        }
        expired.into_iter().map(|(_, guid)| guid).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    #[cfg(test)]
    fn backdate(&mut self, app_id: &str, guid: SessionGuid, by: Duration) {
        if let Some(host) = self.hosts.get_mut(&(app_id.to_string(), guid)) {
            if let Some(earlier) = host.last_seen.checked_sub(by) {
                host.last_seen = earlier;
            }
        }
    }
}
