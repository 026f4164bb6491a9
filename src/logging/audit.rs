//! Rate-limited audit log: every state transition of interest is emitted
//! through a per-event-kind token bucket instead of straight to the log
//! sink, so a flapping route can't flood the audit trail. Reuses `governor`
//! rather than hand-rolling a token bucket here.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use tracing::{error, info, warn};

/// Initiations, nonce exchanges, key completions, SA expiries, and
/// reconfig-induced resets, plus fatal conditions logged immediately before
/// process abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventKind {
    NegotiationInitiated,
    NonceExchanged,
    KeyExchangeCompleted,
    SaExpired,
    ReconfigReset,
    Fatal,
}

const KINDS: [AuditEventKind; 6] = [
    AuditEventKind::NegotiationInitiated,
    AuditEventKind::NonceExchanged,
    AuditEventKind::KeyExchangeCompleted,
    AuditEventKind::SaExpired,
    AuditEventKind::ReconfigReset,
    AuditEventKind::Fatal,
];

fn index_of(kind: AuditEventKind) -> usize {
    KINDS.iter().position(|k| *k == kind).expect("AuditEventKind must be listed in KINDS")
}

/// One independent token bucket per event kind, so a flood of one kind (say,
/// malformed-datagram-triggered nonce exchanges) can't starve the log
/// budget for another (say, fatal conditions).
pub struct AuditLog {
    limiters: Vec<DefaultDirectRateLimiter>,
}

impl AuditLog {
    /// `events_per_second` applies per kind, not globally.
    pub fn new(events_per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(events_per_second.max(1)).unwrap());
        Self {
            limiters: KINDS.iter().map(|_| DefaultDirectRateLimiter::direct(quota)).collect(),
        }
    }

    fn allow(&self, kind: AuditEventKind) -> bool {
        self.limiters[index_of(kind)].check().is_ok()
    }

    pub fn negotiation_initiated(&self, route: &str) {
        if self.allow(AuditEventKind::NegotiationInitiated) {
            info!(route, "negotiation initiated");
        }
    }

    pub fn nonce_exchanged(&self, route: &str) {
        if self.allow(AuditEventKind::NonceExchanged) {
            info!(route, "nonce exchanged");
        }
    }

    pub fn key_exchange_completed(&self, route: &str, rx_spi: u32, tx_spi: u32) {
        if self.allow(AuditEventKind::KeyExchangeCompleted) {
            info!(route, rx_spi, tx_spi, "key exchange completed");
        }
    }

    pub fn sa_expired(&self, route: &str) {
        if self.allow(AuditEventKind::SaExpired) {
            warn!(route, "SA expired");
        }
    }

    pub fn reconfig_reset(&self, route: &str, reason: &str) {
        if self.allow(AuditEventKind::ReconfigReset) {
            info!(route, reason, "route reset by reconfiguration");
        }
    }

    /// Fatal conditions are always logged regardless of rate limit budget -
    /// the process is about to abort, so there's no flood to defend
    /// against and no future tick in which a dropped log would matter.
    pub fn fatal(&self, message: &str) {
        error!("{message}");
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_kind_has_an_independent_budget() {
        let log = AuditLog::new(1);
        assert!(log.allow(AuditEventKind::NegotiationInitiated));
        assert!(!log.allow(AuditEventKind::NegotiationInitiated));
        // a different kind is unaffected by NegotiationInitiated's budget.
        assert!(log.allow(AuditEventKind::SaExpired));
    }
}
