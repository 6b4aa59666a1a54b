//! The UDP SIP transaction layer
//!
//! One socket, one reader task, one handler task per datagram. The
//! dispatch table answers what it can statelessly (OPTIONS, stubs,
//! 405), hands REGISTER to the registrar and INVITE to the router, and
//! continues established dialogs on BYE, CANCEL, INFO and the responses
//! coming back from callees. Final responses are cached per transaction
//! so retransmitted requests get the same answer without reprocessing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use tandem_session_core::{Call, CallState, EndReason};
use tandem_sip_core::{
    build_request, build_response, cseq_number, sdp::build_audio_sdp, Method, SdpSession,
    SipMessage,
};

use tandem_registrar_core::RegisterOutcome;

use crate::context::EngineContext;
use crate::dtmf::{is_dtmf_content_type, parse_dtmf_body};
use crate::error::Error;
use crate::router::{self, media_endpoint, Router};
use crate::transaction::{TransactionCache, TransactionKey};

/// Receive timeout so shutdown can interrupt the reader.
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// The SIP server
pub struct SipServer {
    ctx: Arc<EngineContext>,
    socket: Arc<UdpSocket>,
    router: Router,
    transactions: TransactionCache,
    running: AtomicBool,
}

impl SipServer {
    pub fn new(ctx: Arc<EngineContext>, socket: Arc<UdpSocket>, router: Router) -> Arc<Self> {
        Arc::new(SipServer {
            ctx,
            socket,
            router,
            transactions: TransactionCache::new(),
            running: AtomicBool::new(true),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// The reader loop: one task, spawning a handler per datagram.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; 4096];
        info!("SIP server listening");

        while self.running.load(Ordering::SeqCst) {
            match tokio::time::timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    if self.running.load(Ordering::SeqCst) {
                        warn!(error = %e, "SIP receive error");
                    }
                }
                Ok(Ok((len, src))) => {
                    let raw = String::from_utf8_lossy(&buf[..len]).into_owned();
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_datagram(raw, src).await;
                    });
                }
            }
        }
        info!("SIP server stopped");
    }

    async fn handle_datagram(&self, raw: String, src: SocketAddr) {
        let msg = SipMessage::parse(&raw);
        if msg.is_request() {
            self.handle_request(msg, src).await;
        } else if msg.is_response() {
            self.handle_response(msg, src).await;
        } else {
            warn!(%src, "dropping malformed SIP datagram");
        }
    }

    async fn handle_request(&self, msg: SipMessage, src: SocketAddr) {
        let key = TransactionKey::of(&msg);

        // Retransmission: re-serve the cached final response
        if let Some(key) = &key {
            if let Some((wire, addr)) = self.transactions.lookup(key) {
                debug!(%src, "retransmission; re-sending cached response");
                self.ctx.sender.send_raw(&wire, addr).await;
                return;
            }
        }

        let method = msg.method.clone().unwrap_or(Method::Other(String::new()));
        debug!(%method, %src, "SIP request");

        match method {
            Method::Register => self.on_register(msg, src, key).await,
            Method::Invite => self.on_invite(msg, src, key).await,
            Method::Ack => {
                // ACK finalises a 2xx; nothing to answer
                debug!(%src, "ACK absorbed");
                self.forward_ack_to_callee(&msg).await;
            }
            Method::Bye => self.on_bye(msg, src, key).await,
            Method::Cancel => self.on_cancel(msg, src, key).await,
            Method::Options => {
                self.respond(&msg, src, key, 200, "OK", &[("Allow", Method::ALLOWED)], None)
                    .await;
            }
            Method::Info => self.on_info(msg, src, key).await,
            Method::Subscribe
            | Method::Notify
            | Method::Prack
            | Method::Update
            | Method::Publish
            | Method::Message
            | Method::Refer => {
                // Stateless acknowledgement keeps phones happy; no
                // dialog state is created for these
                self.respond(&msg, src, key, 200, "OK", &[], None).await;
            }
            Method::Other(name) => {
                warn!(method = %name, %src, "unsupported SIP method");
                self.respond(
                    &msg,
                    src,
                    key,
                    405,
                    "Method Not Allowed",
                    &[("Allow", Method::ALLOWED)],
                    None,
                )
                .await;
            }
        }
    }

    async fn on_register(&self, msg: SipMessage, src: SocketAddr, key: Option<TransactionKey>) {
        match self.ctx.registrar.process_register(&msg, src).await {
            RegisterOutcome::Registered { expires, .. } => {
                let expires = expires.to_string();
                self.respond(&msg, src, key, 200, "OK", &[("Expires", &expires)], None)
                    .await;
            }
            RegisterOutcome::Unregistered { .. } => {
                self.respond(&msg, src, key, 200, "OK", &[("Expires", "0")], None)
                    .await;
            }
            RegisterOutcome::Challenge { www_authenticate } => {
                self.respond(
                    &msg,
                    src,
                    key,
                    401,
                    "Unauthorized",
                    &[("WWW-Authenticate", &www_authenticate)],
                    None,
                )
                .await;
            }
            RegisterOutcome::Unauthorized => {
                self.respond(&msg, src, key, 401, "Unauthorized", &[], None).await;
            }
        }
    }

    async fn on_invite(&self, msg: SipMessage, src: SocketAddr, key: Option<TransactionKey>) {
        if self.ctx.is_draining() {
            let (code, reason) = Error::Draining.to_status();
            self.respond(&msg, src, key, code, reason, &[], None).await;
            return;
        }

        // Provisional, before any routing work
        self.respond(&msg, src, None, 100, "Trying", &[], None).await;

        match self.router.route_invite(&self.ctx, &msg, src).await {
            Ok(_) => {}
            Err(Error::Session(tandem_session_core::Error::CallExists(call_id))) => {
                // INVITE retransmitted while the first is still routing;
                // the cached final response will cover later repeats
                debug!(%call_id, "INVITE for call already in progress");
            }
            Err(e) => {
                let (code, reason) = e.to_status();
                self.respond(&msg, src, key, code, reason, &[], None).await;
            }
        }
    }

    async fn on_bye(&self, msg: SipMessage, src: SocketAddr, key: Option<TransactionKey>) {
        self.respond(&msg, src, key, 200, "OK", &[], None).await;

        let Some(call_id) = msg.call_id() else {
            return;
        };
        let Some(call) = self.ctx.calls.get(call_id) else {
            debug!(call_id, "BYE for unknown call");
            return;
        };

        let was_connected = call.state() == CallState::Connected;
        let peer = if Some(src) == call.caller_addr() {
            call.callee_addr()
        } else {
            call.caller_addr()
        };

        let call_id = call_id.to_string();
        self.ctx.calls.end_call(&call_id, EndReason::Bye).await;

        // Tear the other leg down too; a B2BUA owns both dialogs
        if was_connected && !call.routed_to_voicemail() {
            if let Some(peer) = peer {
                self.send_bye_to_peer(&call, peer).await;
            }
        }
    }

    async fn on_cancel(&self, msg: SipMessage, src: SocketAddr, key: Option<TransactionKey>) {
        self.respond(&msg, src, key, 200, "OK", &[], None).await;

        let Some(call_id) = msg.call_id() else {
            return;
        };
        let Some(call) = self.ctx.calls.get(call_id) else {
            return;
        };

        if !matches!(call.state(), CallState::Initiating | CallState::Ringing) {
            debug!(call_id, "CANCEL after answer ignored");
            return;
        }

        // The cancelled INVITE gets its 487
        if let (Some(original), Some(caller_addr)) = (call.original_invite(), call.caller_addr())
        {
            let mut terminated = build_response(487, "Request Terminated", &original, None);
            self.ctx.sender.send(&mut terminated, caller_addr).await;
        }

        router::send_cancel_to_callee(&self.ctx, &call).await;
        self.ctx.calls.end_call(call_id, EndReason::Cancel).await;
    }

    async fn on_info(&self, msg: SipMessage, src: SocketAddr, key: Option<TransactionKey>) {
        let digit = msg
            .header("Content-Type")
            .filter(|ct| is_dtmf_content_type(ct))
            .and_then(|_| parse_dtmf_body(&msg.body));

        if let Some(info) = digit {
            if let Some(call) = msg.call_id().and_then(|id| self.ctx.calls.get(id)) {
                if call.push_dtmf(info.digit) {
                    info!(
                        call_id = %call.call_id(),
                        digit = %info.digit,
                        duration_ms = ?info.duration_ms,
                        "DTMF via SIP INFO"
                    );
                }
            }
        }

        self.respond(&msg, src, key, 200, "OK", &[], None).await;
    }

    /// Responses from callees continue the B2BUA dialog.
    async fn handle_response(&self, msg: SipMessage, src: SocketAddr) {
        let Some(call_id) = msg.call_id() else {
            return;
        };
        let Some(call) = self.ctx.calls.get(call_id) else {
            debug!(call_id, status = ?msg.status_code, "response for unknown call");
            return;
        };

        let status = msg.status_code.unwrap_or_default();
        let for_invite = msg
            .header("CSeq")
            .map(|c| c.to_ascii_uppercase().contains("INVITE"))
            .unwrap_or(false);

        match status {
            180 | 183 if for_invite => {
                let _ = call.transition(CallState::Ringing);
                // Relay ringing progress to the caller
                if let (Some(original), Some(caller_addr)) =
                    (call.original_invite(), call.caller_addr())
                {
                    let reason = msg.reason.clone().unwrap_or_else(|| "Ringing".to_string());
                    let mut progress = build_response(status, &reason, &original, None);
                    self.ctx.sender.send(&mut progress, caller_addr).await;
                }
            }
            200..=299 if for_invite => self.on_callee_answered(call, msg, src).await,
            300..=699 if for_invite => {
                let reason = msg.reason.clone().unwrap_or_else(|| "Refused".to_string());
                warn!(call_id, status, %reason, "callee refused call");
                self.send_ack_to_callee(&call, &msg, src).await;
                if let (Some(original), Some(caller_addr)) =
                    (call.original_invite(), call.caller_addr())
                {
                    let mut refusal = build_response(status, &reason, &original, None);
                    self.ctx.sender.send(&mut refusal, caller_addr).await;
                }
                self.ctx.calls.end_call(call_id, EndReason::Rejected).await;
            }
            _ => debug!(call_id, status, "response absorbed"),
        }
    }

    /// The callee sent 200 OK: capture its media endpoint, ACK its
    /// dialog, and answer the caller with our relay SDP.
    async fn on_callee_answered(&self, call: Arc<Call>, msg: SipMessage, src: SocketAddr) {
        let call_id = call.call_id().to_string();

        if let Some(media) = SdpSession::parse(&msg.body).audio_info() {
            if let Some(endpoint) = media_endpoint(&media) {
                let _ = self
                    .ctx
                    .calls
                    .allocator()
                    .set_endpoints(&call_id, None, Some(endpoint));
                info!(%call_id, %endpoint, "callee media endpoint set on relay");
            }
        }

        // Our dialog with the callee completes with an ACK from us
        self.send_ack_to_callee(&call, &msg, src).await;

        if !self.ctx.calls.connect_call(&call) {
            // Already connected (voicemail answered first) or ended; the
            // CANCEL/BYE path owns this dialog now
            debug!(%call_id, "late 200 OK ignored");
            return;
        }

        let (Some(original), Some(caller_addr), Some(ports)) =
            (call.original_invite(), call.caller_addr(), call.rtp_ports())
        else {
            warn!(%call_id, "answer arrived for incomplete call state");
            self.ctx.calls.end_call(&call_id, EndReason::InternalError).await;
            return;
        };

        let dtmf = &self.ctx.config.sip.dtmf;
        let codecs: Vec<u8> = call
            .caller_media()
            .map(|m| {
                m.formats
                    .iter()
                    .copied()
                    .filter(|&pt| pt != dtmf.payload_type)
                    .collect()
            })
            .unwrap_or_default();
        let sdp = build_audio_sdp(
            &self.ctx.server_ip,
            ports.rtp,
            &call_id,
            &codecs,
            dtmf.payload_type,
            dtmf.ilbc_mode,
        );

        let mut ok = build_response(200, "OK", &original, Some(&sdp));
        // Carry the callee's To tag so the caller's ACK matches
        if let Some(to) = msg.header("To") {
            ok.set_header("To", to);
        }
        ok.set_header("Content-Type", "application/sdp");
        ok.set_header(
            "Contact",
            format!(
                "<sip:{}@{}:{}>",
                call.to_extension(),
                self.ctx.server_ip,
                self.ctx.sip_port()
            ),
        );
        self.ctx.sender.send(&mut ok, caller_addr).await;
        info!(%call_id, "relayed answer to caller");
    }

    /// ACK a callee's final response, completing our client transaction.
    async fn send_ack_to_callee(&self, call: &Arc<Call>, response: &SipMessage, dest: SocketAddr) {
        let Some(outbound) = call.outbound_invite() else {
            return;
        };
        let cseq = outbound
            .header("CSeq")
            .and_then(|c| cseq_number(c).ok())
            .unwrap_or(1);

        let to = response
            .header("To")
            .or_else(|| outbound.header("To"))
            .unwrap_or_default()
            .to_string();
        let mut ack = build_request(
            Method::Ack,
            outbound.uri.as_deref().unwrap_or_default(),
            outbound.header("From").unwrap_or_default(),
            &to,
            call.call_id(),
            cseq,
            None,
        );
        if let Some(via) = outbound.header("Via") {
            ack.set_header("Via", via);
        }
        self.ctx.sender.send(&mut ack, dest).await;
    }

    /// Relay the caller's ACK to the callee so its 200 OK stops
    /// retransmitting.
    async fn forward_ack_to_callee(&self, msg: &SipMessage) {
        let Some(call) = msg.call_id().and_then(|id| self.ctx.calls.get(id)) else {
            return;
        };
        if call.routed_to_voicemail() {
            return;
        }
        let Some(callee_addr) = call.callee_addr() else {
            return;
        };
        let mut ack = msg.clone();
        ack.uri = Some(format!("sip:{}@{}", call.to_extension(), self.ctx.server_ip));
        self.ctx.sender.send(&mut ack, callee_addr).await;
    }

    /// Send a BYE on the dialog toward `peer`.
    pub(crate) async fn send_bye_to_peer(&self, call: &Arc<Call>, peer: SocketAddr) {
        let invite = if Some(peer) == call.callee_addr() {
            call.outbound_invite()
        } else {
            call.original_invite()
        };
        let Some(invite) = invite else {
            return;
        };

        let cseq = invite
            .header("CSeq")
            .and_then(|c| cseq_number(c).ok())
            .unwrap_or(1)
            + 1;
        let mut bye = build_request(
            Method::Bye,
            invite.uri.as_deref().unwrap_or_default(),
            invite.header("From").unwrap_or_default(),
            invite.header("To").unwrap_or_default(),
            call.call_id(),
            cseq,
            None,
        );
        if let Some(via) = invite.header("Via") {
            bye.set_header("Via", via);
        }
        self.ctx.sender.send(&mut bye, peer).await;
        info!(call_id = %call.call_id(), %peer, "sent BYE to peer");
    }

    /// Build, send and (for final responses) cache a reply to a request.
    async fn respond(
        &self,
        request: &SipMessage,
        src: SocketAddr,
        key: Option<TransactionKey>,
        status: u16,
        reason: &str,
        extra_headers: &[(&str, &str)],
        body: Option<&str>,
    ) {
        let mut response = build_response(status, reason, request, body);
        for (name, value) in extra_headers {
            response.set_header(name, *value);
        }

        let wire = response.build();
        if status >= 200 {
            if let Some(key) = key {
                self.transactions.store(key, wire.clone(), src);
            }
        }
        self.ctx.sender.send_raw(&wire, src).await;
    }
}
