//! The call table and cross-cutting call lifecycle operations
//!
//! Lock discipline: the table is touched only to insert, fetch or remove
//! a call by Call-ID; everything slow happens afterwards against the
//! call's own lock. Removal from the table is what makes `end_call`
//! idempotent under racing BYE, CANCEL and timer fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tracing::{info, warn};

use tandem_infra_common::hooks::VoicemailRecorder;
use tandem_infra_common::{CallStatus, CdrSystem, PbxStore, WebhookEvent, WebhookSystem};
use tandem_rtp_core::{PortPair, RelayAllocator, RelayHandler};

use crate::call::{Call, CallState};
use crate::error::{Error, Result};

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// A party sent BYE
    Bye,
    /// The caller cancelled before answer
    Cancel,
    /// The callee rejected (4xx/5xx/6xx on the outbound INVITE)
    Rejected,
    /// Voicemail recording finished (max duration or caller hung up)
    VoicemailComplete,
    /// Server shutdown forced the call down
    Shutdown,
    /// An internal invariant violation ended the call defensively
    InternalError,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Bye => "bye",
            EndReason::Cancel => "cancel",
            EndReason::Rejected => "rejected",
            EndReason::VoicemailComplete => "voicemail_complete",
            EndReason::Shutdown => "shutdown",
            EndReason::InternalError => "internal_error",
        }
    }

    /// Whether the PBX, not a party, initiated the teardown.
    fn is_local(&self) -> bool {
        matches!(
            self,
            EndReason::VoicemailComplete | EndReason::Shutdown | EndReason::InternalError
        )
    }
}

/// Owns every active call and the resources tied to them
pub struct CallManager {
    calls: DashMap<String, Arc<Call>>,
    webhooks: Arc<WebhookSystem>,
    cdr: Arc<CdrSystem>,
    allocator: Arc<RelayAllocator>,
    store: Option<Arc<dyn PbxStore>>,
}

impl CallManager {
    pub fn new(
        webhooks: Arc<WebhookSystem>,
        cdr: Arc<CdrSystem>,
        allocator: Arc<RelayAllocator>,
        store: Option<Arc<dyn PbxStore>>,
    ) -> Self {
        CallManager {
            calls: DashMap::new(),
            webhooks,
            cdr,
            allocator,
            store,
        }
    }

    /// Insert a new call. Fails when the Call-ID is already live.
    pub fn create_call(&self, call_id: &str, from: &str, to: &str) -> Result<Arc<Call>> {
        if self.calls.contains_key(call_id) {
            return Err(Error::CallExists(call_id.to_string()));
        }
        let call = Arc::new(Call::new(call_id, from, to));
        self.calls.insert(call_id.to_string(), Arc::clone(&call));
        Ok(call)
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<Call>> {
        self.calls.get(call_id).map(|c| Arc::clone(&c))
    }

    pub fn active_count(&self) -> usize {
        self.calls.len()
    }

    pub fn all_calls(&self) -> Vec<Arc<Call>> {
        self.calls.iter().map(|c| Arc::clone(&c)).collect()
    }

    /// Record the start of routing: timestamp, CDR, webhook.
    pub async fn start_call(&self, call: &Arc<Call>) {
        call.mark_started();
        self.cdr
            .start_record(call.call_id(), call.from_extension(), call.to_extension())
            .await;
        self.webhooks.trigger(
            WebhookEvent::CallStarted,
            json!({
                "call_id": call.call_id(),
                "from_extension": call.from_extension(),
                "to_extension": call.to_extension(),
                "timestamp": call.start_time().map(|t| t.to_rfc3339()),
            }),
        );
    }

    /// Allocate the call's relay port pair.
    pub async fn allocate_relay(&self, call: &Arc<Call>) -> Result<PortPair> {
        let ports = self.allocator.allocate(call.call_id()).await?;
        call.set_rtp_ports(ports);
        Ok(ports)
    }

    pub fn relay_handler(&self, call_id: &str) -> Option<Arc<RelayHandler>> {
        self.allocator.handler(call_id)
    }

    pub fn allocator(&self) -> &Arc<RelayAllocator> {
        &self.allocator
    }

    /// Mark the call answered. Idempotent; also disarms the no-answer
    /// timer.
    pub fn connect_call(&self, call: &Arc<Call>) -> bool {
        call.cancel_no_answer_timer();
        if !call.mark_connected() {
            return false;
        }
        info!(call_id = %call.call_id(), "call connected");
        self.webhooks.trigger(
            WebhookEvent::CallConnected,
            json!({
                "call_id": call.call_id(),
                "timestamp": call.connect_time().map(|t| t.to_rfc3339()),
            }),
        );
        true
    }

    /// End a call: settle state, stop timers, release the relay and
    /// persist its QoS, finish any voicemail recording, close the CDR,
    /// emit the webhook.
    ///
    /// Removal from the table happens first, so concurrent enders (BYE
    /// racing a timer, say) clean up exactly once; the losers get
    /// `None`.
    pub async fn end_call(&self, call_id: &str, reason: EndReason) -> Option<Arc<Call>> {
        let (_, call) = self.calls.remove(call_id)?;

        call.mark_ended(reason.is_local());
        info!(call_id, reason = reason.as_str(), "call ended");

        let recording_path = call
            .take_voicemail_recorder()
            .and_then(|recorder| recorder.finish());

        if let Some(summaries) = self.allocator.release(call_id) {
            if let Some(store) = &self.store {
                for summary in &summaries {
                    match serde_json::to_value(summary) {
                        Ok(value) => {
                            if let Err(e) = store.store_qos_summary(call_id, value).await {
                                warn!(call_id, error = %e, "QoS summary not persisted");
                            }
                        }
                        Err(e) => warn!(call_id, error = %e, "QoS summary not serializable"),
                    }
                }
            }
        }

        let status = self.final_status(&call, reason);
        self.cdr
            .end_record(call_id, status, recording_path.clone())
            .await;

        self.webhooks.trigger(
            WebhookEvent::CallEnded,
            json!({
                "call_id": call_id,
                "reason": reason.as_str(),
                "duration_seconds": call.duration_seconds(),
                "recording_path": recording_path,
            }),
        );

        Some(call)
    }

    /// Arm the no-answer timer.
    ///
    /// The handler runs after `timeout` unless the timer is aborted
    /// first. Cancellation races are settled by the handler itself: it
    /// must claim the call via [`Call::mark_routed_to_voicemail`] (or
    /// re-check state) before acting, so a fire that lost the race to an
    /// answer is a no-op.
    pub fn arm_no_answer_timer<F, Fut>(&self, call: &Arc<Call>, timeout: Duration, on_fire: F)
    where
        F: FnOnce(Arc<Call>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let armed = Arc::clone(call);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if matches!(armed.state(), CallState::Initiating | CallState::Ringing) {
                on_fire(armed).await;
            }
        });
        call.set_no_answer_timer(handle.abort_handle());
        info!(call_id = %call.call_id(), timeout_secs = timeout.as_secs(), "no-answer timer armed");
    }

    /// Attach a voicemail recording session and arm its max-duration
    /// timer.
    pub fn attach_voicemail<F, Fut>(
        &self,
        call: &Arc<Call>,
        recorder: Arc<dyn VoicemailRecorder>,
        max_duration: Duration,
        on_max_duration: F,
    ) where
        F: FnOnce(Arc<Call>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        call.attach_voicemail_recorder(recorder);
        let armed = Arc::clone(call);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(max_duration).await;
            on_max_duration(armed).await;
        });
        call.set_voicemail_timer(handle.abort_handle());
        info!(
            call_id = %call.call_id(),
            max_secs = max_duration.as_secs(),
            "voicemail recording attached"
        );
    }

    fn final_status(&self, call: &Arc<Call>, reason: EndReason) -> CallStatus {
        if call.routed_to_voicemail() {
            return CallStatus::Voicemail;
        }
        if call.connect_time().is_some() {
            return CallStatus::Completed;
        }
        match reason {
            EndReason::Cancel | EndReason::Bye => CallStatus::Cancelled,
            EndReason::Rejected | EndReason::InternalError => CallStatus::Failed,
            EndReason::VoicemailComplete => CallStatus::Voicemail,
            EndReason::Shutdown => CallStatus::Cancelled,
        }
    }
}
