//! The vita-ske1 key exchange protocol: wire framing, cryptographic
//! primitives, and the per-route negotiation state machine.

pub mod crypto;
pub mod fsm;
pub mod frame;

pub use crypto::{derive_key_material, DerivedKeyMaterial, SpiAllocator};
pub use fsm::{ExchangeFsm, KeyExchangeReady, Negotiated, NegotiatedSpis, ReceiveNonceOutcome};
pub use frame::{decode_datagram, Body, KeyMessage, MessageType, NonceMessage, TransportHeader, IP_PROTOCOL_NUMBER};
