//! # tandem-session-core
//!
//! Per-call state and lifecycle for the tandem PBX.
//!
//! A [`call::Call`] is the unit of coordination: one caller leg, one
//! callee leg, one RTP relay, one CDR. State moves monotonically from
//! `Initiating` through `Ringing` and `Connected` to `Ended` (with the
//! `EndingLocal` branch when this side hangs up first); every transition
//! happens under the call's own lock, and the global table in
//! [`manager::CallManager`] is only ever held long enough to fetch a
//! call by its Call-ID.
//!
//! The manager also owns the cross-cutting pieces of ending a call:
//! stopping timers, releasing the relay (and persisting its QoS
//! summaries), finishing a voicemail recording, closing the CDR and
//! emitting the webhook.

pub mod call;
pub mod codecs;
pub mod error;
pub mod manager;

pub use call::{Call, CallState};
pub use codecs::{codecs_for_model, detect_phone_model, PhoneModel};
pub use error::{Error, Result};
pub use manager::{CallManager, EndReason};
