/*!
 * All configured sessions of one observatory.
 */
use std::collections::BTreeMap;

use futures::future::join_all;
use tracing::{info, warn};

use skylink_core::config::Config;
use skylink_core::event::SharedEventBus;

use crate::error::{Result, SessionError};
use crate::session::Session;

/// Named sessions sharing one event bus
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: BTreeMap<String, Session>,
    bus: SharedEventBus,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            bus: SharedEventBus::new(),
        }
    }

    /// Build a session for every configured device
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let mut registry = Self::new();
        for device in &config.devices {
            let session = Session::from_config(device, &config.session)?;
            registry.insert(session)?;
        }
        info!("Registered {} device sessions", registry.sessions.len());
        Ok(registry)
    }

    /// Add a session; names must be unique
    pub fn insert(&mut self, session: Session) -> Result<()> {
        let name = session.name().to_string();
        if self.sessions.contains_key(&name) {
            return Err(SessionError::DuplicateDevice(name));
        }
        session.attach_event_bus(self.bus.clone());
        self.sessions.insert(name, session);
        Ok(())
    }

    /// Look up a session by device name
    pub fn get(&self, name: &str) -> Result<&Session> {
        self.sessions
            .get(name)
            .ok_or_else(|| SessionError::UnknownDevice(name.to_string()))
    }

    /// Device names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    /// Every session
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Bus carrying every session's events
    pub fn event_bus(&self) -> &SharedEventBus {
        &self.bus
    }

    /// Connect every session concurrently, reporting each outcome
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        let results = join_all(self.sessions.values().map(|s| s.connect())).await;
        self.sessions
            .keys()
            .cloned()
            .zip(results)
            .inspect(|(name, result)| {
                if let Err(e) = result {
                    warn!("Connecting {} failed: {}", name, e);
                }
            })
            .collect()
    }

    /// Disconnect every session concurrently
    pub async fn disconnect_all(&self) {
        let results = join_all(self.sessions.values().map(|s| s.disconnect())).await;
        for (name, result) in self.sessions.keys().zip(results) {
            if let Err(e) = result {
                warn!("Disconnecting {} failed: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skylink_core::config::{DeviceConfig, SessionDefaults, TransportConfig};

    use crate::event::{SessionEvent, SessionEventKind};
    use crate::session::SessionState;

    fn simulated(name: &str, driver: &str) -> DeviceConfig {
        DeviceConfig::new(
            name,
            driver,
            TransportConfig::Simulated {
                model: driver.to_string(),
            },
        )
    }

    fn config() -> Config {
        Config {
            session: SessionDefaults {
                autopoll: false,
                ..SessionDefaults::default()
            },
            devices: vec![
                simulated("focuser", "frame-focuser"),
                simulated("dome", "dome"),
                simulated("mount", "alpaca-telescope"),
            ],
            ..Config::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_all_shares_bus() {
        let registry = SessionRegistry::from_config(&config()).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["dome", "focuser", "mount"]);

        let mut events = registry.event_bus().subscribe::<SessionEvent>().unwrap();
        let results = registry.connect_all().await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        let mut connected = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEventKind::StateChanged { to: SessionState::Idle, .. } = event.kind {
                connected.push(event.device);
            }
        }
        connected.sort();
        assert_eq!(connected, vec!["dome", "focuser", "mount"]);

        registry.disconnect_all().await;
        for session in registry.sessions() {
            assert_eq!(session.state().await, SessionState::Disconnected);
        }
    }

    #[test]
    fn test_lookup_and_duplicates() {
        let mut registry = SessionRegistry::from_config(&config()).unwrap();
        assert!(registry.get("focuser").is_ok());
        assert!(matches!(registry.get("camera"), Err(SessionError::UnknownDevice(_))));

        let again = Session::from_config(&simulated("dome", "dome"), &SessionDefaults::default()).unwrap();
        assert!(matches!(registry.insert(again), Err(SessionError::DuplicateDevice(_))));
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let mut config = config();
        config.devices.push(simulated("focuser", "step-focuser"));
        assert!(matches!(
            SessionRegistry::from_config(&config),
            Err(SessionError::Config(_))
        ));
    }
}
