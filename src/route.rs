//! Route data model: the long-lived configured tunnel unit, its SA slots,
//! its timers, and the lifecycle status that gates initiation.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::{ExchangeFsm, SpiAllocator};
use crate::sa::SaRecord;

/// Stable route identifier, carried through manager/sadb APIs instead of a
/// bare `String` so the two can't be confused at a call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(pub String);

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RouteId {
    fn from(s: String) -> Self {
        RouteId(s)
    }
}

impl From<&str> for RouteId {
    fn from(s: &str) -> Self {
        RouteId(s.to_string())
    }
}

/// A route's lifecycle status. Ordered so `status > expired` / `status >
/// rekey` comparisons in the tick loop read the same as the prose they
/// implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouteStatus {
    Expired,
    Rekey,
    Ready,
}

/// Per-route deadline bookkeeping. All deadlines are absolute instants;
/// `None` means "not armed". Kept as a separate struct purely for clarity —
/// a route without a bound `Instant` encodes "never" rather than a sentinel.
#[derive(Debug, Default, Clone, Copy)]
pub struct RouteTimers {
    pub sa_timeout: Option<Instant>,
    pub prev_sa_timeout: Option<Instant>,
    pub rekey_timeout: Option<Instant>,
    pub next_tx_sa_activation_delay: Option<Instant>,
    /// Armed by a tick's `reset_if_expired` to stagger the next
    /// `initiate_exchange` call.
    pub negotiation_delay: Option<Instant>,
}

/// The four SA slots a route can hold at once.
#[derive(Debug, Default, Clone)]
pub struct SaSlots {
    pub rx_sa: Option<SaRecord>,
    pub prev_rx_sa: Option<SaRecord>,
    pub tx_sa: Option<SaRecord>,
    pub next_tx_sa: Option<SaRecord>,
}

impl SaSlots {
    fn clear(&mut self) {
        self.rx_sa = None;
        self.prev_rx_sa = None;
        self.tx_sa = None;
        self.next_tx_sa = None;
    }
}

/// One configured tunnel to a peer gateway, with its live FSM, SA slots and
/// timers. Created on configuration load; destroyed when the route is
/// removed or its pre-shared key / route SPI changes.
pub struct Route {
    pub id: RouteId,
    pub gateway: Ipv4Addr,
    pub psk: [u8; 32],
    pub route_spi: u32,
    pub negotiation_ttl: Duration,
    pub fsm: ExchangeFsm,
    pub status: RouteStatus,
    pub sas: SaSlots,
    pub timers: RouteTimers,
}

impl Route {
    pub fn new(
        id: RouteId,
        gateway: Ipv4Addr,
        psk: [u8; 32],
        route_spi: u32,
        negotiation_ttl: Duration,
        allocator: Arc<SpiAllocator>,
    ) -> Self {
        Self {
            fsm: ExchangeFsm::new(route_spi, psk, allocator, negotiation_ttl),
            id,
            gateway,
            psk,
            route_spi,
            negotiation_ttl,
            status: RouteStatus::Expired,
            sas: SaSlots::default(),
            timers: RouteTimers::default(),
        }
    }

    /// Tear down all SAs and timers, demoting the route to `expired`, but
    /// keep the route (and its FSM) alive. Used by the sa_timeout path
    /// and by reconfiguration when only resetting state.
    pub fn expire(&mut self) {
        self.sas.clear();
        self.timers = RouteTimers::default();
        self.status = RouteStatus::Expired;
    }

    /// Replace this route's FSM with a fresh one, preserving SAs and
    /// timers. Used when only `negotiation_ttl` changed on reconfiguration
    /// during reconfiguration.
    pub fn reset_fsm(&mut self, negotiation_ttl: Duration, allocator: Arc<SpiAllocator>) {
        self.negotiation_ttl = negotiation_ttl;
        self.fsm = ExchangeFsm::new(self.route_spi, self.psk, allocator, negotiation_ttl);
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("gateway", &self.gateway)
            .field("route_spi", &self.route_spi)
            .field("status", &self.status)
            .field("fsm", &self.fsm)
            .finish()
    }
}
