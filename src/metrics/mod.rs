//! Operator-facing counters, exported through the process's shared
//! counter surface. Backed by `prometheus` `IntCounter`s in a dedicated
//! registry so this crate's counters never collide with a default global
//! registry some other library might also populate.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use serde::Serialize;

/// One `IntCounter` per counter the manager tracks at minimum. `rxerrors`
/// is not stored separately - it is the sum of the four categorised
/// inbound-error counters, computed on read.
#[derive(Clone)]
pub struct Counters {
    registry: Registry,
    pub route_errors: IntCounter,
    pub protocol_errors: IntCounter,
    pub authentication_errors: IntCounter,
    pub public_key_errors: IntCounter,
    pub negotiations_initiated: IntCounter,
    pub negotiations_expired: IntCounter,
    pub nonces_negotiated: IntCounter,
    pub keypairs_negotiated: IntCounter,
    pub keypairs_expired: IntCounter,
}

macro_rules! register_counter {
    ($registry:expr, $name:literal, $help:literal) => {{
        let c = IntCounter::new($name, $help).expect("metric creation");
        $registry.register(Box::new(c.clone())).expect("metric registration");
        c
    }};
}

impl Counters {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("vita_ske".into()), None).expect("failed to create prometheus registry");
        Self {
            route_errors: register_counter!(registry, "route_errors", "inbound datagrams with no matching route SPI"),
            protocol_errors: register_counter!(registry, "protocol_errors", "malformed datagrams or FSM protocol violations"),
            authentication_errors: register_counter!(registry, "authentication_errors", "key messages with a bad HMAC"),
            public_key_errors: register_counter!(registry, "public_key_errors", "key messages with an unsafe public key"),
            negotiations_initiated: register_counter!(registry, "negotiations_initiated", "exchanges this process has started"),
            negotiations_expired: register_counter!(registry, "negotiations_expired", "exchanges reset after their negotiation deadline"),
            nonces_negotiated: register_counter!(registry, "nonces_negotiated", "nonce messages successfully processed"),
            keypairs_negotiated: register_counter!(registry, "keypairs_negotiated", "SA pairs successfully derived"),
            keypairs_expired: register_counter!(registry, "keypairs_expired", "SA pairs torn down on sa_timeout"),
            registry,
        }
    }

    pub fn rxerrors(&self) -> u64 {
        self.route_errors.get() + self.protocol_errors.get() + self.authentication_errors.get() + self.public_key_errors.get()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            rxerrors: self.rxerrors(),
            route_errors: self.route_errors.get(),
            protocol_errors: self.protocol_errors.get(),
            authentication_errors: self.authentication_errors.get(),
            public_key_errors: self.public_key_errors.get(),
            negotiations_initiated: self.negotiations_initiated.get(),
            negotiations_expired: self.negotiations_expired.get(),
            nonces_negotiated: self.nonces_negotiated.get(),
            keypairs_negotiated: self.keypairs_negotiated.get(),
            keypairs_expired: self.keypairs_expired.get(),
        }
    }

    /// Render the registry in Prometheus text exposition format, for a
    /// `/metrics`-style scrape or the CLI's `status` command.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf)?;
        Ok(String::from_utf8(buf).expect("prometheus output is valid utf-8"))
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters").field("rxerrors", &self.rxerrors()).finish_non_exhaustive()
    }
}

/// A point-in-time, serializable copy of [`Counters`] for the CLI and any
/// JSON-speaking health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub rxerrors: u64,
    pub route_errors: u64,
    pub protocol_errors: u64,
    pub authentication_errors: u64,
    pub public_key_errors: u64,
    pub negotiations_initiated: u64,
    pub negotiations_expired: u64,
    pub nonces_negotiated: u64,
    pub keypairs_negotiated: u64,
    pub keypairs_expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rxerrors_is_the_sum_of_the_four_categories() {
        let c = Counters::new();
        c.route_errors.inc();
        c.protocol_errors.inc_by(2);
        c.authentication_errors.inc();
        c.public_key_errors.inc();
        assert_eq!(c.rxerrors(), 5);
        // negotiations_expired is NOT one of the four, must not count here.
        c.negotiations_expired.inc_by(10);
        assert_eq!(c.rxerrors(), 5);
    }
}
