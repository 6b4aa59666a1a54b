//! # tandem-sip-core
//!
//! SIP and SDP codecs for the tandem PBX stack.
//!
//! This crate owns the wire text: it parses UDP datagrams into
//! [`SipMessage`] values, serializes them back per RFC 3261, and does the
//! same for the minimal audio subset of SDP (RFC 4566) that a PBX needs to
//! relay calls. It deliberately stops there. Header *values* are not
//! dissected here; parameter-level interpretation (Via branches, Contact
//! URIs, CSeq numbers) is done by callers through the small helpers in
//! [`uri`].
//!
//! ## Parsing is fail-soft
//!
//! Non-conformant phones are a fact of life, so [`SipMessage::parse`]
//! never returns an error. Line endings are normalised (CRLF, bare CR and
//! bare LF are all accepted), and a malformed start-line simply yields a
//! message with neither a method nor a status code; callers test
//! [`SipMessage::is_request`] / [`SipMessage::is_response`] and reject.
//! Serialization always emits CRLF with the terminating blank line the RFC
//! requires.
//!
//! ## Building messages
//!
//! [`builder`] provides the request/response constructors the transaction
//! layer uses, including the caller-identity headers (P-Asserted-Identity,
//! Remote-Party-ID) and the `X-MAC-Address` device header.

pub mod builder;
pub mod error;
pub mod message;
pub mod sdp;
pub mod uri;

pub use builder::{
    add_caller_identity_headers, add_mac_address_header, build_request, build_response,
};
pub use error::{Error, Result};
pub use message::{Method, SipMessage};
pub use sdp::{build_audio_sdp, MediaInfo, SdpSession};
pub use uri::{cseq_number, extension_from_header, normalize_e164};
