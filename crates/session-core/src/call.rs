//! The per-call record and its state machine

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use tandem_infra_common::hooks::VoicemailRecorder;
use tandem_rtp_core::PortPair;
use tandem_sip_core::{MediaInfo, SipMessage};

use crate::error::{Error, Result};

/// Bound on queued DTMF digits awaiting an IVR consumer.
const DTMF_QUEUE_CAP: usize = 32;

/// Call states; transitions are monotonic toward `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Initiating,
    Ringing,
    Connected,
    /// The PBX side initiated teardown and is waiting to settle
    EndingLocal,
    Ended,
}

impl CallState {
    fn rank(self) -> u8 {
        match self {
            CallState::Initiating => 0,
            CallState::Ringing => 1,
            CallState::Connected => 2,
            CallState::EndingLocal => 3,
            CallState::Ended => 4,
        }
    }
}

/// Everything about a call that changes after creation, guarded by the
/// call's lock.
#[derive(Default)]
struct CallInner {
    state: CallState,
    start_time: Option<DateTime<Utc>>,
    connect_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,

    /// The caller's INVITE, retained for the late 200 OK (voicemail
    /// answer) and CANCEL construction
    original_invite: Option<SipMessage>,
    /// The INVITE we sent toward the callee, retained for CANCEL
    outbound_invite: Option<SipMessage>,

    caller_addr: Option<SocketAddr>,
    callee_addr: Option<SocketAddr>,
    /// The caller's SDP media endpoint and codec list
    caller_media: Option<MediaInfo>,

    rtp_ports: Option<PortPair>,

    no_answer_timer: Option<AbortHandle>,
    voicemail_timer: Option<AbortHandle>,

    routed_to_voicemail: bool,
    voicemail_recorder: Option<Arc<dyn VoicemailRecorder>>,

    /// Digits received via SIP INFO, not yet consumed
    dtmf_queue: VecDeque<char>,
}

/// One call leg pair
pub struct Call {
    call_id: String,
    from_extension: String,
    to_extension: String,
    inner: Mutex<CallInner>,
}

impl Call {
    pub fn new(call_id: &str, from_extension: &str, to_extension: &str) -> Self {
        Call {
            call_id: call_id.to_string(),
            from_extension: from_extension.to_string(),
            to_extension: to_extension.to_string(),
            inner: Mutex::new(CallInner::default()),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn from_extension(&self) -> &str {
        &self.from_extension
    }

    pub fn to_extension(&self) -> &str {
        &self.to_extension
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    /// Advance the state machine. Backward transitions are invariant
    /// violations: logged with context and refused so the caller can end
    /// the call cleanly.
    pub fn transition(&self, to: CallState) -> Result<()> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if to.rank() < from.rank() {
            error!(
                call_id = %self.call_id,
                ?from,
                ?to,
                "state transition out of order"
            );
            return Err(Error::InvalidTransition {
                call_id: self.call_id.clone(),
                from,
                to,
            });
        }
        inner.state = to;
        debug!(call_id = %self.call_id, ?from, ?to, "call state");
        Ok(())
    }

    /// Record the start of routing.
    pub fn mark_started(&self) {
        self.inner.lock().start_time = Some(Utc::now());
    }

    /// Record the answer. Idempotent: a second connect is a no-op, and a
    /// connect after the call ended is ignored (a late 200 OK racing a
    /// CANCEL).
    pub fn mark_connected(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CallState::Initiating | CallState::Ringing => {
                inner.state = CallState::Connected;
                inner.connect_time = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Claim the call for voicemail routing. Returns false when the call
    /// was already answered, already diverted, or already over, making
    /// the no-answer timer's firing a harmless no-op in every race.
    pub fn mark_routed_to_voicemail(&self) -> bool {
        let mut inner = self.inner.lock();
        let state = inner.state;
        if inner.routed_to_voicemail
            || matches!(state, CallState::Connected | CallState::EndingLocal | CallState::Ended)
        {
            return false;
        }
        inner.routed_to_voicemail = true;
        true
    }

    pub fn routed_to_voicemail(&self) -> bool {
        self.inner.lock().routed_to_voicemail
    }

    /// Settle the call into `Ended`, stopping timers. Returns false if
    /// it already was.
    pub fn mark_ended(&self, local_initiated: bool) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == CallState::Ended {
            return false;
        }
        if local_initiated && inner.state == CallState::Connected {
            inner.state = CallState::EndingLocal;
        }
        inner.state = CallState::Ended;
        inner.end_time = Some(Utc::now());
        if let Some(timer) = inner.no_answer_timer.take() {
            timer.abort();
        }
        if let Some(timer) = inner.voicemail_timer.take() {
            timer.abort();
        }
        true
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().start_time
    }

    pub fn connect_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().connect_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().end_time
    }

    pub fn set_original_invite(&self, invite: SipMessage) {
        self.inner.lock().original_invite = Some(invite);
    }

    pub fn original_invite(&self) -> Option<SipMessage> {
        self.inner.lock().original_invite.clone()
    }

    pub fn set_outbound_invite(&self, invite: SipMessage) {
        self.inner.lock().outbound_invite = Some(invite);
    }

    pub fn outbound_invite(&self) -> Option<SipMessage> {
        self.inner.lock().outbound_invite.clone()
    }

    pub fn set_caller_addr(&self, addr: SocketAddr) {
        self.inner.lock().caller_addr = Some(addr);
    }

    pub fn caller_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().caller_addr
    }

    pub fn set_callee_addr(&self, addr: SocketAddr) {
        self.inner.lock().callee_addr = Some(addr);
    }

    pub fn callee_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().callee_addr
    }

    pub fn set_caller_media(&self, media: MediaInfo) {
        self.inner.lock().caller_media = Some(media);
    }

    pub fn caller_media(&self) -> Option<MediaInfo> {
        self.inner.lock().caller_media.clone()
    }

    pub fn set_rtp_ports(&self, ports: PortPair) {
        let mut inner = self.inner.lock();
        if inner.rtp_ports.is_some() {
            // Exactly one pair per call; a second allocation is a bug
            error!(call_id = %self.call_id, "RTP ports assigned twice");
        }
        inner.rtp_ports = Some(ports);
    }

    pub fn rtp_ports(&self) -> Option<PortPair> {
        self.inner.lock().rtp_ports
    }

    pub fn set_no_answer_timer(&self, handle: AbortHandle) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.no_answer_timer.replace(handle) {
            old.abort();
        }
    }

    /// Cancel the no-answer timer (the call was answered). The timer
    /// task may already be running; `mark_routed_to_voicemail` is the
    /// backstop that makes its firing harmless.
    pub fn cancel_no_answer_timer(&self) {
        if let Some(timer) = self.inner.lock().no_answer_timer.take() {
            timer.abort();
        }
    }

    pub fn set_voicemail_timer(&self, handle: AbortHandle) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.voicemail_timer.replace(handle) {
            old.abort();
        }
    }

    pub fn attach_voicemail_recorder(&self, recorder: Arc<dyn VoicemailRecorder>) {
        self.inner.lock().voicemail_recorder = Some(recorder);
    }

    pub fn take_voicemail_recorder(&self) -> Option<Arc<dyn VoicemailRecorder>> {
        self.inner.lock().voicemail_recorder.take()
    }

    /// Queue a DTMF digit received via SIP INFO. Invalid digits and
    /// overflow beyond the queue cap are dropped.
    pub fn push_dtmf(&self, digit: char) -> bool {
        if !matches!(digit, '0'..='9' | '*' | '#' | 'A'..='D') {
            warn!(call_id = %self.call_id, ?digit, "ignoring invalid DTMF digit");
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.dtmf_queue.len() >= DTMF_QUEUE_CAP {
            warn!(call_id = %self.call_id, "DTMF queue full, dropping digit");
            return false;
        }
        inner.dtmf_queue.push_back(digit);
        true
    }

    /// Take the oldest queued DTMF digit.
    pub fn take_dtmf(&self) -> Option<char> {
        self.inner.lock().dtmf_queue.pop_front()
    }

    /// Seconds from start to end (or now).
    pub fn duration_seconds(&self) -> i64 {
        let inner = self.inner.lock();
        match inner.start_time {
            Some(start) => {
                let end = inner.end_time.unwrap_or_else(Utc::now);
                (end - start).num_seconds()
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let call = Call::new("c1", "1001", "1002");
        assert_eq!(call.state(), CallState::Initiating);

        call.mark_started();
        call.transition(CallState::Ringing).unwrap();
        assert!(call.mark_connected());
        assert_eq!(call.state(), CallState::Connected);
        assert!(call.connect_time().is_some());

        // Second connect is a no-op
        assert!(!call.mark_connected());

        assert!(call.mark_ended(false));
        assert_eq!(call.state(), CallState::Ended);
        assert!(!call.mark_ended(false));
    }

    #[test]
    fn backward_transition_is_refused() {
        let call = Call::new("c2", "1001", "1002");
        call.mark_connected();
        let err = call.transition(CallState::Ringing).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        // The call is still usable and still Connected
        assert_eq!(call.state(), CallState::Connected);
    }

    #[test]
    fn connect_after_end_is_ignored() {
        let call = Call::new("c3", "1001", "1002");
        call.mark_ended(false);
        assert!(!call.mark_connected());
        assert_eq!(call.state(), CallState::Ended);
    }

    #[test]
    fn voicemail_claim_races() {
        let call = Call::new("c4", "1001", "1002");
        assert!(call.mark_routed_to_voicemail());
        // Only one claimant wins
        assert!(!call.mark_routed_to_voicemail());

        let answered = Call::new("c5", "1001", "1002");
        answered.mark_connected();
        assert!(!answered.mark_routed_to_voicemail());

        let over = Call::new("c6", "1001", "1002");
        over.mark_ended(false);
        assert!(!over.mark_routed_to_voicemail());
    }

    #[test]
    fn dtmf_queue_validates_and_bounds() {
        let call = Call::new("c7", "1001", "1002");
        assert!(call.push_dtmf('5'));
        assert!(call.push_dtmf('#'));
        assert!(call.push_dtmf('*'));
        assert!(call.push_dtmf('A'));
        assert!(!call.push_dtmf('x'));
        assert!(!call.push_dtmf('E'));

        assert_eq!(call.take_dtmf(), Some('5'));
        assert_eq!(call.take_dtmf(), Some('#'));
        assert_eq!(call.take_dtmf(), Some('*'));
        assert_eq!(call.take_dtmf(), Some('A'));
        assert_eq!(call.take_dtmf(), None);

        for _ in 0..DTMF_QUEUE_CAP {
            call.push_dtmf('1');
        }
        assert!(!call.push_dtmf('2'), "queue must be bounded");
    }

    #[test]
    fn local_teardown_passes_through_ending_local() {
        let call = Call::new("c8", "1001", "1002");
        call.mark_connected();
        call.mark_ended(true);
        // EndingLocal is transitional; the call settles Ended
        assert_eq!(call.state(), CallState::Ended);
        assert!(call.end_time().is_some());
    }
}
