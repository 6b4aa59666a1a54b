//! # tandem-infra-common
//!
//! Contracts between the PBX core and its external collaborators.
//!
//! The core keeps all live call state in memory; everything durable or
//! optional sits behind a narrow interface defined here:
//!
//! - [`store::PbxStore`]: the persistence contract (extensions,
//!   registered phones, call detail records, QoS summaries), with
//!   [`store::MemoryStore`] as the reference implementation. Transient
//!   store failures degrade: in-memory state stays authoritative and
//!   writes are dropped with a warning.
//! - [`cdr::CdrSystem`]: call detail record lifecycle.
//! - [`events`]: the webhook event fan-out.
//! - [`hooks`]: opaque collaborator hooks the router diverts into
//!   (emergency, auto-attendant, paging, voicemail) plus the voicemail
//!   media pipeline and the optional STIR/SHAKEN verifier.

pub mod cdr;
pub mod error;
pub mod events;
pub mod hooks;
pub mod store;

pub use cdr::{CallStatus, CdrSystem};
pub use error::{StoreError, StoreResult};
pub use events::{WebhookEvent, WebhookSink, WebhookSystem};
pub use hooks::{
    Attestation, AutoAttendant, CallAttempt, EmergencyHandler, PagingSystem, StirShakenVerifier,
    VoicemailAccess, VoicemailPipeline, VoicemailRecorder,
};
pub use store::{CallRecord, ExtensionRecord, MemoryStore, PbxStore, PhoneRecord, PhoneRegistration};
