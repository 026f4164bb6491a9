//! The Key Manager: owns every route's FSM, drives time-based transitions,
//! dispatches inbound datagrams, installs derived SAs and their lifecycle,
//! reconciles configuration changes, and publishes the SA database.
//! Single-threaded cooperative, driven by [`KeyManager::tick`] - no
//! operation here blocks on I/O beyond the database's own throttled atomic
//! file replace.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::manager::diff_routes;
use crate::config::{ManagerConfig, RouteConfig};
use crate::error::{FsmError, ManagerError};
use crate::logging::audit::AuditLog;
use crate::metrics::Counters;
use crate::protocol::{decode_datagram, Body, DerivedKeyMaterial, ExchangeFsm, ReceiveNonceOutcome, SpiAllocator};
use crate::route::{Route, RouteId, RouteStatus};
use crate::sa::{SaDatabase, SaRecord};

/// Upper bound of the anti-synchronisation jitter: `uniform(0, 0.25)`
/// seconds, added to negotiation-delay and rekey-timeout arming so that a
/// fleet of routes that all expired together don't retry in lockstep.
const JITTER_MAX_SECS: f64 = 0.25;

/// A datagram ready to go out over the wire: which route it belongs to (so
/// the host knows the destination gateway) and the fully framed bytes
/// (Transport header + body). Wrapping in an IPv4 header and actually
/// transmitting it is the host's job (out of scope here, same as NIC
/// drivers).
#[derive(Debug, Clone)]
pub struct OutboundDatagram {
    pub route: RouteId,
    pub gateway: Ipv4Addr,
    pub bytes: Vec<u8>,
}

/// Everything a single [`KeyManager::tick`] call produced.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub outbound: Vec<OutboundDatagram>,
}

impl TickOutput {
    fn push(&mut self, route: &RouteId, gateway: Ipv4Addr, bytes: Vec<u8>) {
        self.outbound.push(OutboundDatagram { route: route.clone(), gateway, bytes });
    }
}

pub struct KeyManager {
    routes: HashMap<RouteId, Route>,
    route_spi_index: HashMap<u32, RouteId>,
    allocator: Arc<SpiAllocator>,
    sadb: SaDatabase,
    sadb_path: std::path::PathBuf,
    counters: Arc<Counters>,
    audit: Arc<AuditLog>,
    negotiation_ttl: Duration,
    sa_ttl: Duration,
}

impl KeyManager {
    /// `now` arms every configured route's initial `negotiation_delay` so
    /// the first exchange is kicked off on the next tick, rather than
    /// waiting for a deadline that was never set to expire.
    pub fn new(config: &ManagerConfig, counters: Arc<Counters>, audit: Arc<AuditLog>, now: Instant) -> Self {
        let allocator = Arc::new(SpiAllocator::new());
        let mut manager = Self {
            routes: HashMap::new(),
            route_spi_index: HashMap::new(),
            allocator,
            sadb: SaDatabase::new(),
            sadb_path: config.sadb_path.clone(),
            counters,
            audit,
            negotiation_ttl: config.negotiation_ttl,
            sa_ttl: config.sa_ttl,
        };
        for route_config in &config.routes {
            manager.insert_route(route_config, now);
        }
        manager
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Inspect a single route's live state - its SA slots, timers and
    /// lifecycle status. Used by the `status` CLI command and by
    /// integration tests asserting on cutover/rekey behaviour.
    pub fn route(&self, id: &RouteId) -> Option<&Route> {
        self.routes.get(id)
    }

    fn insert_route(&mut self, cfg: &RouteConfig, now: Instant) {
        let id: RouteId = cfg.id.clone().into();
        let mut route = Route::new(id.clone(), cfg.gateway, cfg.psk, cfg.route_spi, self.negotiation_ttl, self.allocator.clone());
        route.timers.negotiation_delay = Some(now);
        self.route_spi_index.insert(cfg.route_spi, id.clone());
        self.routes.insert(id, route);
    }

    fn remove_route(&mut self, id: &RouteId) {
        if let Some(route) = self.routes.remove(id) {
            self.route_spi_index.remove(&route.route_spi);
            self.sadb.teardown_route(id);
        }
    }

    fn jitter(&self) -> Duration {
        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..JITTER_MAX_SECS))
    }

    /// Reconcile the route set against a freshly loaded configuration
    /// `negotiation_ttl`/`sa_ttl` changes are
    /// process-wide and applied regardless of per-route deltas.
    pub fn reconfigure(&mut self, new_config: &ManagerConfig, now: Instant) {
        let ttl_changed = new_config.negotiation_ttl != self.negotiation_ttl;
        let old_configs: Vec<RouteConfig> = self
            .routes
            .values()
            .map(|r| RouteConfig { id: r.id.0.clone(), gateway: r.gateway, psk: r.psk, route_spi: r.route_spi })
            .collect();
        let delta = diff_routes(&old_configs, &new_config.routes, ttl_changed);

        self.negotiation_ttl = new_config.negotiation_ttl;
        self.sa_ttl = new_config.sa_ttl;
        self.sadb_path = new_config.sadb_path.clone();

        for id in &delta.removed {
            let id: RouteId = id.clone().into();
            self.audit.reconfig_reset(&id.0, "route removed");
            self.remove_route(&id);
        }
        for cfg in &delta.replaced {
            let id: RouteId = cfg.id.clone().into();
            self.audit.reconfig_reset(&id.0, "pre-shared key or route SPI changed");
            self.remove_route(&id);
            self.insert_route(cfg, now);
        }
        for cfg in &delta.added {
            self.audit.reconfig_reset(&cfg.id, "route added");
            self.insert_route(cfg, now);
        }
        for cfg in &delta.ttl_changed {
            let id: RouteId = cfg.id.clone().into();
            if let Some(route) = self.routes.get_mut(&id) {
                self.audit.reconfig_reset(&id.0, "negotiation_ttl changed");
                route.reset_fsm(self.negotiation_ttl, self.allocator.clone());
            }
        }
        // `delta.unchanged` routes are left completely untouched: reloading
        // an identical configuration must leave all route FSMs, SAs, and
        // timers strictly unmodified.
    }

    /// Run one control-loop tick: eight ordered steps, with strict ordering
    /// required within a tick.
    pub fn tick(&mut self, now: Instant, inbound: Vec<Vec<u8>>) -> Result<TickOutput, ManagerError> {
        let mut out = TickOutput::default();

        // Step 1: drain inbound datagrams.
        for datagram in inbound {
            self.handle_inbound(now, &datagram, &mut out)?;
        }

        let route_ids: Vec<RouteId> = self.routes.keys().cloned().collect();
        for id in &route_ids {
            // Step 2: reset_if_expired + arm negotiation_delay.
            let expired = {
                let route = self.routes.get_mut(id).expect("route present for its own id");
                route.fsm.reset_if_expired(now)
            };
            if expired {
                self.counters.negotiations_expired.inc();
                let route = self.routes.get_mut(id).expect("route present for its own id");
                route.timers.negotiation_delay = Some(now + self.negotiation_ttl + self.jitter());
            }

            let route = self.routes.get_mut(id).expect("route present for its own id");

            // Step 3: sa_timeout tears down all four SA slots.
            if route.status > RouteStatus::Expired {
                if let Some(deadline) = route.timers.sa_timeout {
                    if now >= deadline {
                        self.audit.sa_expired(&id.0);
                        self.counters.keypairs_expired.inc();
                        self.sadb.teardown_route(id);
                        route.expire();
                    }
                }
            }

            // Step 4: prev_sa_timeout clears only prev_rx_sa.
            if let Some(deadline) = route.timers.prev_sa_timeout {
                if now >= deadline {
                    if let Some(prev) = route.sas.prev_rx_sa.take() {
                        self.sadb.remove_inbound(prev.spi);
                    }
                    route.timers.prev_sa_timeout = None;
                }
            }

            // Step 5: rekey_timeout downgrades ready -> rekey.
            if route.status > RouteStatus::Rekey {
                if let Some(deadline) = route.timers.rekey_timeout {
                    if now >= deadline {
                        route.status = RouteStatus::Rekey;
                    }
                }
            }

            // Step 6: negotiation_delay elapsed -> initiate_exchange. No
            // delay armed at all (e.g. a route just downgraded to `rekey`
            // by step 5, or freshly configured) means eligible immediately;
            // `Some(deadline)` only ever pushes eligibility further out, to
            // stagger retries after an expiry (step 2's anti-sync jitter).
            if route.status < RouteStatus::Ready {
                let eligible = match route.timers.negotiation_delay {
                    None => true,
                    Some(deadline) => now >= deadline,
                };
                if eligible {
                    if route.fsm.is_idle() {
                        if let Ok((_self_spi, nonce)) = route.fsm.initiate_exchange(now) {
                            route.timers.negotiation_delay = None;
                            self.counters.negotiations_initiated.inc();
                            self.audit.negotiation_initiated(&id.0);
                            let bytes = crate::protocol::frame::encode_nonce_datagram(route.route_spi, &nonce);
                            out.push(id, route.gateway, bytes);
                        }
                    }
                }
            }

            // Step 7: promote a queued next_tx_sa once its delay elapses.
            if let Some(deadline) = route.timers.next_tx_sa_activation_delay {
                if now >= deadline {
                    if let Some(next) = route.sas.next_tx_sa.take() {
                        if let Some(old) = route.sas.tx_sa.take() {
                            self.sadb.remove_outbound(old.spi);
                        }
                        self.sadb.insert_outbound(next.clone());
                        route.sas.tx_sa = Some(next);
                    }
                    route.timers.next_tx_sa_activation_delay = None;
                }
            }
        }

        // Step 8: throttled SA database publish.
        if self.sadb.is_dirty() {
            self.sadb.publish(&self.sadb_path, now)?;
        }

        Ok(out)
    }

    fn handle_inbound(&mut self, now: Instant, datagram: &[u8], out: &mut TickOutput) -> Result<(), ManagerError> {
        let (header, body) = match decode_datagram(datagram) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.counters.protocol_errors.inc();
                return Ok(());
            }
        };

        let Some(id) = self.route_spi_index.get(&header.spi).cloned() else {
            self.counters.route_errors.inc();
            return Ok(());
        };

        let gateway = self.routes.get(&id).expect("indexed route exists").gateway;
        let route_spi = self.routes.get(&id).expect("indexed route exists").route_spi;

        match body {
            Body::Nonce(nonce) => {
                let route = self.routes.get_mut(&id).expect("indexed route exists");
                match route.fsm.receive_nonce(now, nonce.nonce) {
                    Ok(ReceiveNonceOutcome::PassiveReply(reply)) => {
                        self.counters.nonces_negotiated.inc();
                        self.audit.nonce_exchanged(&id.0);
                        let bytes = crate::protocol::frame::encode_nonce_datagram(route_spi, &reply);
                        out.push(&id, gateway, bytes);
                    }
                    Ok(ReceiveNonceOutcome::Ready(ready)) => {
                        self.counters.nonces_negotiated.inc();
                        self.audit.nonce_exchanged(&id.0);
                        let key_msg = ready.exchange_key();
                        let bytes = crate::protocol::frame::encode_key_datagram(route_spi, &key_msg);
                        out.push(&id, gateway, bytes);
                    }
                    Err(err) => self.count_fsm_error(now, &id, err),
                }
            }
            Body::Key(key_msg) => {
                let route = self.routes.get_mut(&id).expect("indexed route exists");
                match route.fsm.receive_key(now, key_msg) {
                    Ok((reply, negotiated)) => {
                        if let Some(reply) = reply {
                            let bytes = crate::protocol::frame::encode_key_datagram(route_spi, &reply);
                            out.push(&id, gateway, bytes);
                        }
                        match negotiated.derive_ephemeral_keys() {
                            Ok((rx, tx, spis)) => {
                                self.install_keypair(&id, rx, spis.rx_spi, tx, spis.tx_spi, now)?;
                            }
                            Err(FsmError::Parameter) => {
                                self.counters.public_key_errors.inc();
                            }
                            Err(_) => unreachable!("derive_ephemeral_keys only returns Parameter"),
                        }
                    }
                    Err(err) => self.count_fsm_error(now, &id, err),
                }
            }
        }
        Ok(())
    }

    /// `receive_nonce`/`receive_key` no longer return `Expired` themselves —
    /// `reset_if_expired` is the only place a negotiation deadline is ever
    /// checked. The `Expired` arm stays here only so this match stays
    /// exhaustive against `FsmError`; if it's ever hit, the route still gets
    /// the same jitter-armed `negotiation_delay` step 2 arms on a real
    /// expiry, so a retry storm can't follow from it either way.
    fn count_fsm_error(&mut self, now: Instant, id: &RouteId, err: FsmError) {
        match err {
            FsmError::Protocol => self.counters.protocol_errors.inc(),
            FsmError::Authentication => self.counters.authentication_errors.inc(),
            FsmError::Parameter => self.counters.public_key_errors.inc(),
            FsmError::Expired => {
                self.counters.negotiations_expired.inc();
                let delay = self.negotiation_ttl + self.jitter();
                if let Some(route) = self.routes.get_mut(id) {
                    route.timers.negotiation_delay = Some(now + delay);
                }
            }
        }
    }

    /// Install a freshly derived rx/tx key pair for a route.
    fn install_keypair(
        &mut self,
        id: &RouteId,
        rx: DerivedKeyMaterial,
        rx_spi: u32,
        tx: DerivedKeyMaterial,
        tx_spi: u32,
        now: Instant,
    ) -> Result<(), ManagerError> {
        if self.sadb.inbound_collides(rx_spi, id) {
            self.audit.fatal(&format!("ephemeral SPI {rx_spi} collides with an existing inbound SA outside route {id}"));
            return Err(ManagerError::SpiCollision { spi: rx_spi, other_route: id.0.clone() });
        }

        let route = self.routes.get_mut(id).expect("indexed route exists");
        route.status = RouteStatus::Ready;

        if let Some(old_prev) = route.sas.prev_rx_sa.take() {
            self.sadb.remove_inbound(old_prev.spi);
        }
        if let Some(old_rx) = route.sas.rx_sa.take() {
            route.sas.prev_rx_sa = Some(old_rx);
            route.timers.prev_sa_timeout = route.timers.sa_timeout.take();
        }
        let rx_sa = SaRecord::new(id.clone(), rx_spi, rx);
        route.sas.rx_sa = Some(rx_sa.clone());
        self.sadb.insert_inbound(rx_sa);

        let tx_sa = SaRecord::new(id.clone(), tx_spi, tx);
        if route.sas.tx_sa.is_none() || route.sas.next_tx_sa.is_some() {
            if let Some(stale) = route.sas.next_tx_sa.take() {
                // the stale pending SA was never published; nothing to remove.
                let _ = stale;
            }
            if let Some(old_tx) = route.sas.tx_sa.take() {
                self.sadb.remove_outbound(old_tx.spi);
            }
            route.sas.tx_sa = Some(tx_sa.clone());
            self.sadb.insert_outbound(tx_sa);
            route.timers.next_tx_sa_activation_delay = None;
        } else {
            route.sas.next_tx_sa = Some(tx_sa);
            route.timers.next_tx_sa_activation_delay = Some(now + self.negotiation_ttl.mul_f64(1.5));
        }

        route.timers.sa_timeout = Some(now + self.sa_ttl);
        route.timers.rekey_timeout = Some(now + self.sa_ttl / 2 + self.jitter());

        self.counters.keypairs_negotiated.inc();
        self.audit.key_exchange_completed(&id.0, rx_spi, tx_spi);
        Ok(())
    }
}
