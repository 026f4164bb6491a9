//! Process and route configuration.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod manager;

fn default_negotiation_ttl() -> Duration {
    Duration::from_secs(5)
}

fn default_sa_ttl() -> Duration {
    Duration::from_secs(600)
}

/// One configured route: `{id, gateway IPv4, 64-hex-char pre-shared key,
/// route SPI}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    pub gateway: Ipv4Addr,
    #[serde(with = "hex::serde")]
    pub psk: [u8; 32],
    pub route_spi: u32,
}

/// Process-wide configuration: routes plus the process-wide knobs
/// (`negotiation_ttl`, `sa_ttl`, node address, SA-database path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_negotiation_ttl", with = "humantime_duration")]
    pub negotiation_ttl: Duration,
    #[serde(default = "default_sa_ttl", with = "humantime_duration")]
    pub sa_ttl: Duration,
    pub node_address: Ipv4Addr,
    pub sadb_path: PathBuf,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            negotiation_ttl: default_negotiation_ttl(),
            sa_ttl: default_sa_ttl(),
            node_address: Ipv4Addr::new(0, 0, 0, 0),
            sadb_path: PathBuf::from("./vita-ske-sadb.json"),
            routes: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Accumulates every violation rather than failing on the first.
    pub fn validate(&self) -> Result<(), Vec<crate::error::ConfigError>> {
        use crate::error::ConfigError;
        let mut errors = Vec::new();

        if self.negotiation_ttl.is_zero() {
            // zero is allowed: every initiated exchange just expires on the
            // following tick instead of being given any grace period.
        }
        if self.sa_ttl.is_zero() {
            errors.push(ConfigError::Invalid("sa_ttl must be greater than zero".into()));
        }

        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_spis = std::collections::HashMap::new();
        for route in &self.routes {
            if route.id.is_empty() {
                errors.push(ConfigError::Invalid("route id cannot be empty".into()));
            }
            if !seen_ids.insert(route.id.clone()) {
                errors.push(ConfigError::Invalid(format!("duplicate route id '{}'", route.id)));
            }
            if let Some(other) = seen_spis.insert(route.route_spi, route.id.clone()) {
                errors.push(ConfigError::Invalid(format!(
                    "route SPI {} used by both '{}' and '{}'",
                    route.route_spi, other, route.id
                )));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Overlay `VITA_*` environment variables onto a loaded configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("VITA_NODE_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                self.node_address = parsed;
            }
        }
        if let Ok(path) = std::env::var("VITA_SADB_PATH") {
            self.sadb_path = PathBuf::from(path);
        }
        if let Ok(secs) = std::env::var("VITA_NEGOTIATION_TTL_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.negotiation_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(secs) = std::env::var("VITA_SA_TTL_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.sa_ttl = Duration::from_secs(secs);
            }
        }
    }
}

/// What changed between an old and new `ManagerConfig`, at route
/// granularity.
#[derive(Debug, Default)]
pub struct ConfigDelta {
    pub added: Vec<RouteConfig>,
    pub removed: Vec<String>,
    /// Pre-shared key or route SPI changed: treat as a brand new route
    /// (tear down the old one, stand up a new one).
    pub replaced: Vec<RouteConfig>,
    /// Only `negotiation_ttl` differs at the route's FSM: replace just the
    /// FSM, keep SAs and timers.
    pub ttl_changed: Vec<RouteConfig>,
    /// Identical to the prior route: no action.
    pub unchanged: Vec<RouteConfig>,
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_route_spi_is_rejected() {
        let cfg = ManagerConfig {
            routes: vec![
                RouteConfig { id: "a".into(), gateway: Ipv4Addr::LOCALHOST, psk: [0u8; 32], route_spi: 1 },
                RouteConfig { id: "b".into(), gateway: Ipv4Addr::LOCALHOST, psk: [1u8; 32], route_spi: 1 },
            ],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_negotiation_ttl_is_allowed() {
        let cfg = ManagerConfig {
            negotiation_ttl: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
