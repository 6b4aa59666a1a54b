//! Collaborator hooks
//!
//! The router and session manager divert certain calls into opaque
//! collaborators: emergency handling, the auto-attendant, paging,
//! voicemail access, the voicemail recording pipeline, and the optional
//! STIR/SHAKEN verifier. The core defines the seams; implementations
//! live outside it. Null implementations are provided so a bare core
//! still routes extension-to-extension calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Context handed to a diversion hook
#[derive(Debug, Clone)]
pub struct CallAttempt {
    pub call_id: String,
    pub from_extension: String,
    pub to_extension: String,
}

/// Emergency call collaborator (Kari's Law routing)
pub trait EmergencyHandler: Send + Sync {
    /// Whether the dialed string is an emergency number this handler
    /// takes over.
    fn is_emergency_number(&self, dialed: &str) -> bool;

    /// Handle the emergency call. Returns false when the call could not
    /// be placed, in which case the router fails the call.
    fn handle_emergency_call(&self, attempt: &CallAttempt) -> bool;
}

/// Auto-attendant collaborator
pub trait AutoAttendant: Send + Sync {
    /// The extension the attendant answers on.
    fn extension(&self) -> &str;

    fn handle_call(&self, attempt: &CallAttempt) -> bool;
}

/// Paging/intercom collaborator
pub trait PagingSystem: Send + Sync {
    fn is_paging_extension(&self, dialed: &str) -> bool;

    fn handle_page(&self, attempt: &CallAttempt) -> bool;
}

/// Voicemail box access collaborator (`*xxxx` dialing)
pub trait VoicemailAccess: Send + Sync {
    fn handle_access(&self, attempt: &CallAttempt, mailbox: &str) -> bool;
}

/// A running voicemail recording session, fed by the RTP relay.
///
/// The media pipeline behind it (greeting playback, tone, file write)
/// is opaque to the core; the core only starts it, stops it, and stores
/// the resulting path on the CDR.
pub trait VoicemailRecorder: Send + Sync {
    fn call_id(&self) -> &str;

    /// Stop recording and return the stored recording's path, if any.
    fn finish(&self) -> Option<String>;
}

/// Voicemail collaborator: creates recording sessions.
pub trait VoicemailPipeline: Send + Sync {
    /// Begin recording the caller audio arriving at `rtp_port` for
    /// `mailbox`. Returns `None` when recording cannot start, in which
    /// case the call is ended instead of diverted.
    fn start_recording(
        &self,
        call_id: &str,
        mailbox: &str,
        rtp_port: u16,
    ) -> Option<Arc<dyn VoicemailRecorder>>;
}

/// STIR/SHAKEN attestation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attestation {
    /// Full attestation
    A,
    /// Partial attestation
    B,
    /// Gateway attestation
    C,
}

/// Optional caller-identity verifier for inbound Identity headers
pub trait StirShakenVerifier: Send + Sync {
    /// Verify a PASSporT from an Identity header. `None` means the
    /// token did not verify.
    fn verify(&self, identity_header: &str) -> Option<Attestation>;
}

/// No-op recorder used when no voicemail pipeline is wired in
pub struct NullRecorder {
    call_id: String,
    finished: AtomicBool,
}

impl NullRecorder {
    pub fn new(call_id: &str) -> Self {
        NullRecorder {
            call_id: call_id.to_string(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl VoicemailRecorder for NullRecorder {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    fn finish(&self) -> Option<String> {
        self.finished.store(true, Ordering::SeqCst);
        info!(call_id = %self.call_id, "voicemail recording finished (null pipeline)");
        None
    }
}

/// Pipeline that accepts every recording into a [`NullRecorder`]
pub struct NullVoicemailPipeline;

impl VoicemailPipeline for NullVoicemailPipeline {
    fn start_recording(
        &self,
        call_id: &str,
        mailbox: &str,
        rtp_port: u16,
    ) -> Option<Arc<dyn VoicemailRecorder>> {
        info!(call_id, mailbox, rtp_port, "voicemail recording started (null pipeline)");
        Some(Arc::new(NullRecorder::new(call_id)))
    }
}
