//! # tandem-call-engine
//!
//! The top of the tandem PBX stack: the UDP SIP transaction layer, the
//! call router, and the composition root that wires registry, sessions,
//! relay and collaborators into a running server.
//!
//! ## Data flow
//!
//! ```text
//! UDP datagram
//!   └─ SipServer (parse, retransmission cache, dispatch by method)
//!        ├─ REGISTER  -> Registrar
//!        ├─ INVITE    -> Router -> CallManager + RelayAllocator
//!        ├─ BYE/CANCEL/INFO -> CallManager
//!        └─ responses -> dialog continuation (B2BUA answer relay)
//! ```
//!
//! The engine is a B2BUA: the caller's dialog terminates here and a new
//! INVITE (fresh SDP pointing at our relay port, caller identity
//! headers, device MAC) goes out to the callee. Media never touches the
//! signaling socket; each call's RTP flows through its own relay pair.

pub mod config;
pub mod context;
pub mod dtmf;
pub mod engine;
pub mod error;
pub mod router;
pub mod server;
pub mod transaction;

pub use config::PbxConfig;
pub use context::{EngineContext, Hooks};
pub use engine::PbxEngine;
pub use error::{Error, Result};
pub use router::Router;
pub use server::SipServer;
