//! The vita-ske1 per-route exchange state machine.
//!
//! `idle`, `wait_nonce` and `wait_key` are the three states a caller can ever
//! see reported back. `_send_key` and `_complete` are not variants of
//! [`FsmState`] at all: they are the borrowed, one-shot [`KeyExchangeReady`]
//! and [`Negotiated`] values returned by `receive_nonce` and `receive_key`.
//! Each exposes exactly one consuming method, so the compiler — not a
//! runtime check — is what prevents `exchange_key`/`derive_ephemeral_keys`
//! from ever running twice for the same negotiation. Because `Negotiated`
//! lives outside of `FsmState` entirely, the FSM itself has already settled
//! into its next real state by the time a caller can fail to call
//! `derive_ephemeral_keys` (or call it and hit `parameter`) — there is no
//! window in which the FSM itself can get stuck.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::crypto::{derive_key_material, key_message_hmac, verify_key_message_hmac, DerivedKeyMaterial, SpiAllocator};
use super::frame::{KeyMessage, NonceMessage};
use crate::error::FsmError;

/// Scratch a passive peer keeps while sitting in `idle`, between replying to
/// a nonce and eventually seeing the initiator's key message.
///
/// This is load-bearing, not incidental: `idle` never arms a deadline, so a
/// peer that missed the nonce phase entirely and only
/// shows up with a key message much later can still be brought into sync.
/// The FSM's externally-visible status never leaves `idle` while this is
/// held — only `derive_ephemeral_keys` (reached via `receive_key`) clears it.
struct PassiveScratch {
    self_spi: u32,
    self_nonce: [u8; 32],
    peer_nonce: [u8; 32],
    secret: EphemeralSecret,
    public: PublicKey,
}

enum FsmState {
    Idle {
        passive: Option<PassiveScratch>,
    },
    WaitNonce {
        self_spi: u32,
        self_nonce: [u8; 32],
        deadline: Instant,
    },
    WaitKey {
        self_spi: u32,
        self_nonce: [u8; 32],
        peer_nonce: [u8; 32],
        secret: EphemeralSecret,
        public: PublicKey,
        deadline: Instant,
    },
}

impl std::fmt::Debug for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsmState::Idle { passive } => f.debug_struct("Idle").field("passive", &passive.is_some()).finish(),
            FsmState::WaitNonce { self_spi, deadline, .. } => f
                .debug_struct("WaitNonce")
                .field("self_spi", self_spi)
                .field("deadline", deadline)
                .finish(),
            FsmState::WaitKey { self_spi, deadline, .. } => f
                .debug_struct("WaitKey")
                .field("self_spi", self_spi)
                .field("deadline", deadline)
                .finish(),
        }
    }
}

/// One side of a vita-ske1 negotiation for a single route.
pub struct ExchangeFsm {
    route_spi: u32,
    psk: [u8; 32],
    allocator: Arc<SpiAllocator>,
    negotiation_ttl: Duration,
    state: FsmState,
}

impl std::fmt::Debug for ExchangeFsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeFsm")
            .field("route_spi", &self.route_spi)
            .field("state", &self.state)
            .finish()
    }
}

impl ExchangeFsm {
    pub fn new(route_spi: u32, psk: [u8; 32], allocator: Arc<SpiAllocator>, negotiation_ttl: Duration) -> Self {
        Self {
            route_spi,
            psk,
            allocator,
            negotiation_ttl,
            state: FsmState::Idle { passive: None },
        }
    }

    /// True only when there is no live active-side negotiation (`wait_nonce`/
    /// `wait_key`). A populated passive scratch still reports `idle`.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, FsmState::Idle { .. })
    }

    fn fresh_keypair() -> (EphemeralSecret, PublicKey) {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    fn fresh_nonce() -> [u8; 32] {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    /// `idle -> wait_nonce`. Fails with `protocol` if a passive exchange is
    /// already in flight for this route (at most one exchange per route).
    pub fn initiate_exchange(&mut self, now: Instant) -> Result<(u32, NonceMessage), FsmError> {
        match &self.state {
            FsmState::Idle { passive: None } => {
                let self_spi = self.allocator.next();
                let self_nonce = Self::fresh_nonce();
                self.state = FsmState::WaitNonce {
                    self_spi,
                    self_nonce,
                    deadline: now + self.negotiation_ttl,
                };
                Ok((self_spi, NonceMessage { nonce: self_nonce }))
            }
            _ => Err(FsmError::Protocol),
        }
    }

    /// `idle -> idle` (passive reply) or `wait_nonce -> _send_key` (active,
    /// simultaneous-start case).
    ///
    /// The `idle` branch generates and stores our own ephemeral keypair
    /// immediately — by the time the peer's key message arrives we must
    /// already know our own public key to authenticate our reply — and
    /// replies with our own nonce, without changing the state a caller can
    /// observe.
    pub fn receive_nonce(&mut self, now: Instant, peer_nonce: [u8; 32]) -> Result<ReceiveNonceOutcome<'_>, FsmError> {
        match &self.state {
            FsmState::Idle { .. } => {
                let self_spi = self.allocator.next();
                let self_nonce = Self::fresh_nonce();
                let (secret, public) = Self::fresh_keypair();
                self.state = FsmState::Idle {
                    passive: Some(PassiveScratch {
                        self_spi,
                        self_nonce,
                        peer_nonce,
                        secret,
                        public,
                    }),
                };
                Ok(ReceiveNonceOutcome::PassiveReply(NonceMessage { nonce: self_nonce }))
            }
            FsmState::WaitNonce { self_spi, self_nonce, .. } => {
                // Whether this negotiation has run past its deadline is
                // `reset_if_expired`'s call alone, polled once per tick before
                // any inbound message for this route is ever dispatched; a
                // reply arriving in the same tick the deadline notionally
                // elapses must still complete under the state it found.
                let self_spi = *self_spi;
                let self_nonce = *self_nonce;
                Ok(ReceiveNonceOutcome::Ready(KeyExchangeReady {
                    fsm: self,
                    self_spi,
                    self_nonce,
                    peer_nonce,
                    deadline: now + self.negotiation_ttl,
                }))
            }
            FsmState::WaitKey { .. } => Err(FsmError::Protocol),
        }
    }

    /// `wait_key -> _complete` (active side) or `idle -> _complete` (passive
    /// side, emitting its own key message as a reply in the same call).
    pub fn receive_key(&mut self, _now: Instant, msg: KeyMessage) -> Result<(Option<KeyMessage>, Negotiated), FsmError> {
        match std::mem::replace(&mut self.state, FsmState::Idle { passive: None }) {
            FsmState::WaitKey {
                self_spi,
                self_nonce,
                peer_nonce,
                secret,
                public,
                deadline,
            } => {
                if !verify_key_message_hmac(&self.psk, self.route_spi, &peer_nonce, &self_nonce, msg.spi, &msg.public_key, &msg.auth_code) {
                    self.state = FsmState::WaitKey {
                        self_spi,
                        self_nonce,
                        peer_nonce,
                        secret,
                        public,
                        deadline,
                    };
                    return Err(FsmError::Authentication);
                }
                // self.state is already Idle{passive: None} via the replace above.
                Ok((
                    None,
                    Negotiated {
                        secret,
                        self_public: public,
                        peer_public: PublicKey::from(msg.public_key),
                        self_spi,
                        peer_spi: msg.spi,
                    },
                ))
            }
            FsmState::Idle { passive: Some(scratch) } => {
                if !verify_key_message_hmac(
                    &self.psk,
                    self.route_spi,
                    &scratch.peer_nonce,
                    &scratch.self_nonce,
                    msg.spi,
                    &msg.public_key,
                    &msg.auth_code,
                ) {
                    self.state = FsmState::Idle { passive: Some(scratch) };
                    return Err(FsmError::Authentication);
                }
                let auth_code = key_message_hmac(
                    &self.psk,
                    self.route_spi,
                    &scratch.self_nonce,
                    &scratch.peer_nonce,
                    scratch.self_spi,
                    scratch.public.as_bytes(),
                );
                let reply = KeyMessage {
                    spi: scratch.self_spi,
                    public_key: *scratch.public.as_bytes(),
                    auth_code,
                };
                // self.state is already Idle{passive: None} via the replace above.
                Ok((
                    Some(reply),
                    Negotiated {
                        secret: scratch.secret,
                        self_public: scratch.public,
                        peer_public: PublicKey::from(msg.public_key),
                        self_spi: scratch.self_spi,
                        peer_spi: msg.spi,
                    },
                ))
            }
            other @ (FsmState::Idle { passive: None } | FsmState::WaitNonce { .. }) => {
                self.state = other;
                Err(FsmError::Protocol)
            }
        }
    }

    /// Clears a `wait_nonce`/`wait_key` deadline that has elapsed, returning
    /// to `idle`. A populated passive scratch is never expired this way —
    /// it has no deadline at all.
    pub fn reset_if_expired(&mut self, now: Instant) -> bool {
        let expired = match &self.state {
            FsmState::WaitNonce { deadline, .. } => now > *deadline,
            FsmState::WaitKey { deadline, .. } => now > *deadline,
            FsmState::Idle { .. } => false,
        };
        if expired {
            self.state = FsmState::Idle { passive: None };
        }
        expired
    }

    /// Unconditionally returns to `idle`, discarding any scratch (including
    /// a retained passive scratch). Used by the manager when tearing down or
    /// reconfiguring a route (pre-shared key or route SPI change).
    pub fn force_reset(&mut self) {
        self.state = FsmState::Idle { passive: None };
    }
}

/// What calling `receive_nonce` can produce: either nothing changed about
/// our externally-visible state (a passive reply nonce went out), or we're
/// ready to send our own key message via [`KeyExchangeReady::exchange_key`].
pub enum ReceiveNonceOutcome<'a> {
    PassiveReply(NonceMessage),
    Ready(KeyExchangeReady<'a>),
}

/// The hidden `_send_key` state: produced by [`ExchangeFsm::receive_nonce`]
/// from `wait_nonce`, consumed by the single call to
/// [`KeyExchangeReady::exchange_key`] it permits.
pub struct KeyExchangeReady<'a> {
    fsm: &'a mut ExchangeFsm,
    self_spi: u32,
    self_nonce: [u8; 32],
    peer_nonce: [u8; 32],
    deadline: Instant,
}

impl<'a> KeyExchangeReady<'a> {
    /// `_send_key -> wait_key`. Generates our ephemeral X25519 keypair and
    /// returns the authenticated `KeyMessage` to send.
    pub fn exchange_key(self) -> KeyMessage {
        let (secret, public) = ExchangeFsm::fresh_keypair();
        let auth_code = key_message_hmac(&self.fsm.psk, self.fsm.route_spi, &self.self_nonce, &self.peer_nonce, self.self_spi, public.as_bytes());
        self.fsm.state = FsmState::WaitKey {
            self_spi: self.self_spi,
            self_nonce: self.self_nonce,
            peer_nonce: self.peer_nonce,
            secret,
            public,
            deadline: self.deadline,
        };
        KeyMessage {
            spi: self.self_spi,
            public_key: *public.as_bytes(),
            auth_code,
        }
    }
}

/// The hidden `_complete` state: produced by [`ExchangeFsm::receive_key`],
/// consumed by the single call to [`Negotiated::derive_ephemeral_keys`] it
/// permits. This struct lives entirely outside of [`FsmState`] — the FSM has
/// already moved on to its next real state by the time a caller holds one —
/// so a `parameter` failure here can never leave the FSM itself stuck.
pub struct Negotiated {
    secret: EphemeralSecret,
    self_public: PublicKey,
    peer_public: PublicKey,
    self_spi: u32,
    peer_spi: u32,
}

/// The SPI pairing for a completed exchange: `rx` uses the SPI this party
/// chose and sent in its own key message; `tx` uses whatever SPI the peer
/// sent in theirs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedSpis {
    pub rx_spi: u32,
    pub tx_spi: u32,
}

impl Negotiated {
    /// `_complete -> (rx key material, tx key material, their SPIs)`.
    ///
    /// Fails with `parameter` when the scalar multiplication yields an
    /// unsafe (all-zero-contribution) shared secret. `KDF(q, a, b)`, with
    /// `a`/`b` the two exchanged public keys, swapped between directions so
    /// rx and tx never share key material.
    pub fn derive_ephemeral_keys(self) -> Result<(DerivedKeyMaterial, DerivedKeyMaterial, NegotiatedSpis), FsmError> {
        let shared = self.secret.diffie_hellman(&self.peer_public);
        if !shared.was_contributory() {
            return Err(FsmError::Parameter);
        }
        let q = shared.as_bytes();
        let rx = derive_key_material(q, self.peer_public.as_bytes(), self.self_public.as_bytes());
        let tx = derive_key_material(q, self.self_public.as_bytes(), self.peer_public.as_bytes());
        Ok((rx, tx, NegotiatedSpis { rx_spi: self.self_spi, tx_spi: self.peer_spi }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsm(route_spi: u32, psk: [u8; 32]) -> ExchangeFsm {
        ExchangeFsm::new(route_spi, psk, Arc::new(SpiAllocator::new()), Duration::from_secs(5))
    }

    fn ready_or_panic(outcome: ReceiveNonceOutcome<'_>) -> KeyExchangeReady<'_> {
        match outcome {
            ReceiveNonceOutcome::Ready(ready) => ready,
            ReceiveNonceOutcome::PassiveReply(_) => panic!("expected the active-side Ready outcome"),
        }
    }

    /// Simultaneous-start exchange: both sides call `initiate_exchange`, so
    /// both see the `wait_nonce -> _send_key` branch of `receive_nonce`.
    #[test]
    fn happy_path_simultaneous_start_derives_matching_cross_keys() {
        let psk = [42u8; 32];
        let mut a = fsm(7, psk);
        let mut b = fsm(7, psk);
        let t0 = Instant::now();

        let (_, nonce_a) = a.initiate_exchange(t0).unwrap();
        let (_, nonce_b) = b.initiate_exchange(t0).unwrap();

        let ready_a = ready_or_panic(a.receive_nonce(t0, nonce_b.nonce).unwrap());
        let key_from_a = ready_a.exchange_key();

        let ready_b = ready_or_panic(b.receive_nonce(t0, nonce_a.nonce).unwrap());
        let key_from_b = ready_b.exchange_key();

        let (reply_a, negotiated_a) = a.receive_key(t0, key_from_b).unwrap();
        let (reply_b, negotiated_b) = b.receive_key(t0, key_from_a).unwrap();
        assert!(reply_a.is_none());
        assert!(reply_b.is_none());

        let (a_rx, a_tx, a_spis) = negotiated_a.derive_ephemeral_keys().unwrap();
        let (b_rx, b_tx, b_spis) = negotiated_b.derive_ephemeral_keys().unwrap();
        assert_eq!(a_rx.key, b_tx.key);
        assert_eq!(a_rx.salt, b_tx.salt);
        assert_eq!(a_tx.key, b_rx.key);
        assert_eq!(a_tx.salt, b_rx.salt);
        assert_eq!(a_spis.rx_spi, b_spis.tx_spi);
        assert_eq!(a_spis.tx_spi, b_spis.rx_spi);
        assert!(a.is_idle());
        assert!(b.is_idle());
    }

    /// B never calls `initiate_exchange`; it only ever reacts, exercising the
    /// `idle -> idle` and `idle -> _complete` (with reply) branches.
    #[test]
    fn passive_peer_that_never_initiated_still_completes() {
        let psk = [1u8; 32];
        let mut a = fsm(9, psk);
        let mut b = fsm(9, psk);
        let t0 = Instant::now();

        let (_, nonce_a) = a.initiate_exchange(t0).unwrap();
        let reply = match b.receive_nonce(t0, nonce_a.nonce).unwrap() {
            ReceiveNonceOutcome::PassiveReply(n) => n,
            ReceiveNonceOutcome::Ready(_) => panic!("b is idle, must reply passively"),
        };
        assert!(b.is_idle());

        let ready_a = ready_or_panic(a.receive_nonce(t0, reply.nonce).unwrap());
        let key_from_a = ready_a.exchange_key();

        // b, still reporting idle, completes and emits its own key message.
        let (key_from_b, negotiated_b) = b.receive_key(t0, key_from_a).unwrap();
        let key_from_b = key_from_b.expect("passive completion must reply with a key message");
        assert!(b.is_idle());

        let (reply_a, negotiated_a) = a.receive_key(t0, key_from_b).unwrap();
        assert!(reply_a.is_none());

        let (a_rx, a_tx, _) = negotiated_a.derive_ephemeral_keys().unwrap();
        let (b_rx, b_tx, _) = negotiated_b.derive_ephemeral_keys().unwrap();
        assert_eq!(a_rx.key, b_tx.key);
        assert_eq!(a_tx.key, b_rx.key);
    }

    /// A peer that shows up late with just a key message, well after the
    /// nonce phase, is still served from retained passive scratch.
    #[test]
    fn late_key_message_after_long_idle_gap_still_completes() {
        let psk = [3u8; 32];
        let mut a = fsm(12, psk);
        let mut b = fsm(12, psk);
        let t0 = Instant::now();

        let (_, nonce_a) = a.initiate_exchange(t0).unwrap();
        let reply = match b.receive_nonce(t0, nonce_a.nonce).unwrap() {
            ReceiveNonceOutcome::PassiveReply(n) => n,
            ReceiveNonceOutcome::Ready(_) => unreachable!(),
        };
        let ready_a = ready_or_panic(a.receive_nonce(t0, reply.nonce).unwrap());
        let key_from_a = ready_a.exchange_key();

        // b's passive scratch has no deadline: even arbitrarily far in the
        // future, the key message still completes.
        let far_future = t0 + Duration::from_secs(3600);
        let (key_from_b, negotiated_b) = b.receive_key(far_future, key_from_a).unwrap();
        assert!(key_from_b.is_some());
        negotiated_b.derive_ephemeral_keys().unwrap();
    }

    #[test]
    fn wrong_psk_fails_authentication_without_panicking() {
        let mut a = fsm(3, [1u8; 32]);
        let mut b = fsm(3, [2u8; 32]);
        let t0 = Instant::now();

        let (_, nonce_a) = a.initiate_exchange(t0).unwrap();
        let (_, nonce_b) = b.initiate_exchange(t0).unwrap();

        let ready_a = ready_or_panic(a.receive_nonce(t0, nonce_b.nonce).unwrap());
        let _key_from_a = ready_a.exchange_key();

        let ready_b = ready_or_panic(b.receive_nonce(t0, nonce_a.nonce).unwrap());
        let key_from_b = ready_b.exchange_key();

        assert!(matches!(a.receive_key(t0, key_from_b), Err(FsmError::Authentication)));
        // state must be unaffected by the auth failure.
        assert!(!a.is_idle());
    }

    #[test]
    fn wait_nonce_deadline_expires() {
        let mut a = fsm(11, [5u8; 32]);
        let t0 = Instant::now();
        a.initiate_exchange(t0).unwrap();
        let well_past = t0 + Duration::from_secs(6);
        assert!(a.reset_if_expired(well_past));
        assert!(a.is_idle());
    }

    #[test]
    fn cannot_initiate_twice_or_from_wait_key() {
        let mut a = fsm(13, [6u8; 32]);
        let t0 = Instant::now();
        a.initiate_exchange(t0).unwrap();
        assert!(matches!(a.initiate_exchange(t0), Err(FsmError::Protocol)));
    }
}
