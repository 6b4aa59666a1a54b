//! Call routing policy
//!
//! The router classifies each INVITE before any call state exists:
//! emergency dialing is checked before everything else, the special
//! destinations (attendant, voicemail access, paging) divert to their
//! collaborators, and what remains must be a registered extension the
//! dialplan allows. Only then does a call get created, a relay
//! allocated, and the B2BUA INVITE built toward the callee.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use tandem_infra_common::hooks::CallAttempt;
use tandem_session_core::{codecs_for_model, detect_phone_model, Call, EndReason};
use tandem_sip_core::{
    add_caller_identity_headers, add_mac_address_header, build_request, build_response,
    cseq_number, extension_from_header, sdp::build_audio_sdp, Method, SdpSession, SipMessage,
};

use crate::config::DialplanConfig;
use crate::context::EngineContext;
use crate::error::{Error, Result};

/// Compiled dialplan patterns
pub struct Dialplan {
    emergency: Regex,
    internal: Regex,
    conference: Regex,
    voicemail: Regex,
    queue: Regex,
    parking: Regex,
    auto_attendant: Regex,
    paging: Regex,
}

impl Dialplan {
    /// Compile the configured patterns. A malformed pattern is a
    /// startup error, not something to discover on the first call.
    pub fn compile(config: &DialplanConfig) -> anyhow::Result<Dialplan> {
        Ok(Dialplan {
            emergency: Regex::new(&config.emergency_pattern)?,
            internal: Regex::new(&config.internal_pattern)?,
            conference: Regex::new(&config.conference_pattern)?,
            voicemail: Regex::new(&config.voicemail_pattern)?,
            queue: Regex::new(&config.queue_pattern)?,
            parking: Regex::new(&config.parking_pattern)?,
            auto_attendant: Regex::new(&config.auto_attendant_pattern)?,
            paging: Regex::new(&config.paging_pattern)?,
        })
    }

    pub fn is_emergency(&self, dialed: &str) -> bool {
        self.emergency.is_match(dialed)
    }

    pub fn is_paging(&self, dialed: &str) -> bool {
        self.paging.is_match(dialed)
    }

    /// Whether any dialplan category admits the dialed string.
    pub fn allows(&self, dialed: &str) -> bool {
        self.emergency.is_match(dialed)
            || self.internal.is_match(dialed)
            || self.conference.is_match(dialed)
            || self.voicemail.is_match(dialed)
            || self.auto_attendant.is_match(dialed)
            || self.parking.is_match(dialed)
            || self.queue.is_match(dialed)
    }
}

/// What routing did with an INVITE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Forwarded to the callee; the dialog continues asynchronously
    Routed,
    /// Handed to a collaborator hook
    Diverted,
}

/// Routes INVITEs
pub struct Router {
    dialplan: Dialplan,
}

impl Router {
    pub fn new(config: &DialplanConfig) -> anyhow::Result<Router> {
        Ok(Router {
            dialplan: Dialplan::compile(config)?,
        })
    }

    pub fn dialplan(&self) -> &Dialplan {
        &self.dialplan
    }

    /// Route one INVITE. Errors map to the SIP status the transaction
    /// layer answers with.
    pub async fn route_invite(
        &self,
        ctx: &Arc<EngineContext>,
        msg: &SipMessage,
        src: SocketAddr,
    ) -> Result<RouteAction> {
        let from_header = msg.header("From").ok_or(Error::UnparsableAddress)?.to_string();
        let to_header = msg.header("To").ok_or(Error::UnparsableAddress)?.to_string();
        let call_id = msg.call_id().ok_or(Error::UnparsableAddress)?.to_string();

        let from_ext =
            extension_from_header(&from_header).ok_or(Error::UnparsableAddress)?;
        let to_ext = extension_from_header(&to_header).ok_or(Error::UnparsableAddress)?;

        let attempt = CallAttempt {
            call_id: call_id.clone(),
            from_extension: from_ext.clone(),
            to_extension: to_ext.clone(),
        };

        // Verify caller attestation when a STIR/SHAKEN collaborator is
        // wired in; verification failure is recorded, not enforced
        if let Some(verifier) = &ctx.hooks.stir_shaken {
            if let Some(identity) = msg.header("Identity") {
                match verifier.verify(identity) {
                    Some(attestation) => {
                        debug!(%call_id, ?attestation, "caller identity verified")
                    }
                    None => warn!(%call_id, "caller Identity header failed verification"),
                }
            }
        }

        // Emergency dialing is checked before every other rule so a 911
        // call can never be blocked by dialplan configuration.
        let is_emergency = match &ctx.hooks.emergency {
            Some(handler) => handler.is_emergency_number(&to_ext),
            None => self.dialplan.is_emergency(&to_ext),
        };
        if is_emergency {
            info!(%call_id, %from_ext, %to_ext, "emergency call");
            let handled = ctx
                .hooks
                .emergency
                .as_ref()
                .map(|h| h.handle_emergency_call(&attempt))
                .unwrap_or(false);
            return if handled {
                Ok(RouteAction::Diverted)
            } else {
                Err(Error::CollaboratorUnavailable("emergency"))
            };
        }

        // Auto-attendant extension
        let attendant_ext = ctx
            .hooks
            .auto_attendant
            .as_ref()
            .map(|a| a.extension().to_string())
            .unwrap_or_else(|| ctx.config.dialplan.auto_attendant_extension.clone());
        if to_ext == attendant_ext {
            if let Some(attendant) = &ctx.hooks.auto_attendant {
                if attendant.handle_call(&attempt) {
                    return Ok(RouteAction::Diverted);
                }
            }
            return Err(Error::CollaboratorUnavailable("auto-attendant"));
        }

        // Voicemail box access: * followed by a 3-4 digit mailbox.
        // Checked before paging so *7xx is never misread as a page.
        if let Some(mailbox) = to_ext.strip_prefix('*') {
            if (3..=4).contains(&mailbox.len()) {
                if let Some(access) = &ctx.hooks.voicemail_access {
                    if access.handle_access(&attempt, mailbox) {
                        return Ok(RouteAction::Diverted);
                    }
                }
                return Err(Error::CollaboratorUnavailable("voicemail access"));
            }
        }

        // Paging zones, only when a paging collaborator exists
        if let Some(paging) = &ctx.hooks.paging {
            if paging.is_paging_extension(&to_ext) && paging.handle_page(&attempt) {
                return Ok(RouteAction::Diverted);
            }
        }

        if !ctx.registry.is_registered(&to_ext) {
            warn!(%to_ext, "callee not registered");
            return Err(Error::CalleeNotRegistered(to_ext));
        }

        if !self.dialplan.allows(&to_ext) {
            warn!(%to_ext, "dialplan denied");
            return Err(Error::DialplanDenied(to_ext));
        }

        let caller_media = if msg.body.is_empty() {
            None
        } else {
            SdpSession::parse(&msg.body).audio_info()
        };

        let call = ctx.calls.create_call(&call_id, &from_ext, &to_ext)?;
        call.set_original_invite(msg.clone());
        call.set_caller_addr(src);
        ctx.calls.start_call(&call).await;

        let ports = match ctx.calls.allocate_relay(&call).await {
            Ok(ports) => ports,
            Err(e) => {
                warn!(%call_id, error = %e, "relay allocation failed");
                ctx.calls.end_call(&call_id, EndReason::InternalError).await;
                return Err(e.into());
            }
        };

        // Install the caller's SDP endpoint right away so RTP arriving
        // before the 200 OK teaches the relay instead of being dropped
        if let Some(media) = &caller_media {
            call.set_caller_media(media.clone());
            if let Some(endpoint) = media_endpoint(media) {
                let _ = ctx
                    .calls
                    .allocator()
                    .set_endpoints(&call_id, Some(endpoint), None);
                info!(%call_id, rtp = ports.rtp, %endpoint, "caller endpoint set on relay");
            }
        }

        let Some(callee_addr) = ctx.registry.contact_of(&to_ext) else {
            // Registration expired between the check and here
            ctx.calls.end_call(&call_id, EndReason::InternalError).await;
            return Err(Error::CalleeNotRegistered(to_ext));
        };
        call.set_callee_addr(callee_addr);

        let invite = self.build_callee_invite(ctx, msg, &call, ports.rtp, &from_header, &to_header).await;
        call.set_outbound_invite(invite.clone());
        let mut invite = invite;
        ctx.sender.send(&mut invite, callee_addr).await;
        info!(%call_id, from_ext = %call.from_extension(), to_ext = %call.to_extension(), %callee_addr, "forwarded INVITE");

        let timeout = Duration::from_secs(ctx.config.voicemail.no_answer_timeout);
        let ctx_timer = Arc::clone(ctx);
        ctx.calls.arm_no_answer_timer(&call, timeout, move |call| async move {
            handle_no_answer(ctx_timer, call).await;
        });

        Ok(RouteAction::Routed)
    }

    /// The fresh INVITE sent toward the callee: our SDP at the relay
    /// port, caller identity headers, and the device MAC when known.
    async fn build_callee_invite(
        &self,
        ctx: &Arc<EngineContext>,
        original: &SipMessage,
        call: &Arc<Call>,
        rtp_port: u16,
        from_header: &str,
        to_header: &str,
    ) -> SipMessage {
        let from_ext = call.from_extension();
        let to_ext = call.to_extension();
        let dtmf = &ctx.config.sip.dtmf;

        // Narrow the offer for handsets with known codec restrictions
        let caller_codecs = caller_codec_list(call, dtmf.payload_type);
        let callee_model = detect_phone_model(ctx.registry.user_agent_of(to_ext).as_deref());
        let codecs = codecs_for_model(callee_model, &caller_codecs);
        if let Some(model) = callee_model {
            info!(call_id = %call.call_id(), ?model, ?codecs, "callee codec restriction applied");
        }

        let sdp = build_audio_sdp(
            &ctx.server_ip,
            rtp_port,
            call.call_id(),
            &codecs,
            dtmf.payload_type,
            dtmf.ilbc_mode,
        );

        let cseq = original
            .header("CSeq")
            .and_then(|c| cseq_number(c).ok())
            .unwrap_or(1);

        let mut invite = build_request(
            Method::Invite,
            &format!("sip:{}@{}", to_ext, ctx.server_ip),
            from_header,
            to_header,
            call.call_id(),
            cseq,
            Some(&sdp),
        );

        // Keep the caller's Via so the initial responses find their way
        if let Some(via) = original.header("Via") {
            invite.set_header("Via", via);
        }
        invite.set_header(
            "Contact",
            format!("<sip:{}@{}:{}>", from_ext, ctx.server_ip, ctx.sip_port()),
        );
        invite.set_header("Content-Type", "application/sdp");

        let caller_id = &ctx.config.sip.caller_id;
        if caller_id.send_p_asserted_identity || caller_id.send_remote_party_id {
            let display_name = ctx
                .registry
                .lookup(from_ext)
                .map(|e| e.name)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| from_ext.to_string());
            add_caller_identity_headers(&mut invite, from_ext, &display_name, &ctx.server_ip);
        }

        if ctx.config.sip.device.send_mac_address {
            if let Some(mac) = self.caller_mac(ctx, original, from_ext).await {
                add_mac_address_header(&mut invite, &mac);
            }
        }

        invite
    }

    /// The caller's device MAC: tracking table first, then the live
    /// registration, then (when allowed) the INVITE itself.
    async fn caller_mac(
        &self,
        ctx: &Arc<EngineContext>,
        original: &SipMessage,
        from_ext: &str,
    ) -> Option<String> {
        if let Some(store) = &ctx.store {
            match store.phones_by_extension(from_ext).await {
                Ok(rows) => {
                    if let Some(mac) = rows.into_iter().find_map(|r| r.mac) {
                        return Some(mac);
                    }
                }
                Err(e) => debug!(from_ext, error = %e, "phone lookup failed"),
            }
        }
        if let Some(mac) = ctx.registry.mac_of(from_ext) {
            return Some(mac);
        }
        if ctx.config.sip.device.accept_mac_in_invite {
            return original.header("X-MAC-Address").map(str::to_string);
        }
        None
    }
}

/// No-answer timeout: cancel the callee leg, answer the caller toward
/// the relay, and hand the call to the voicemail pipeline.
pub async fn handle_no_answer(ctx: Arc<EngineContext>, call: Arc<Call>) {
    // Claim the call; answered or already-diverted calls make this a
    // harmless no-op even if the timer fired mid-race.
    if !call.mark_routed_to_voicemail() {
        debug!(call_id = %call.call_id(), "no-answer timer fired after answer; ignoring");
        return;
    }
    let call_id = call.call_id().to_string();
    info!(%call_id, "no answer, routing to voicemail");

    send_cancel_to_callee(&ctx, &call).await;

    if !answer_for_voicemail(&ctx, &call).await {
        warn!(%call_id, "cannot answer for voicemail; ending call");
        ctx.calls.end_call(&call_id, EndReason::InternalError).await;
        return;
    }

    let rtp_port = call.rtp_ports().map(|p| p.rtp).unwrap_or_default();
    match ctx
        .hooks
        .voicemail
        .start_recording(&call_id, call.to_extension(), rtp_port)
    {
        Some(recorder) => {
            let max = Duration::from_secs(ctx.config.voicemail.max_message_duration);
            let ctx_timer = Arc::clone(&ctx);
            ctx.calls.attach_voicemail(&call, recorder, max, move |call| async move {
                let call_id = call.call_id().to_string();
                info!(%call_id, "voicemail max duration reached");
                ctx_timer.calls.end_call(&call_id, EndReason::VoicemailComplete).await;
            });
        }
        None => {
            warn!(%call_id, "voicemail pipeline refused recording; ending call");
            ctx.calls.end_call(&call_id, EndReason::VoicemailComplete).await;
        }
    }
}

/// CANCEL the outbound INVITE so the callee's phone stops ringing.
pub async fn send_cancel_to_callee(ctx: &Arc<EngineContext>, call: &Arc<Call>) {
    let (Some(outbound), Some(callee_addr)) = (call.outbound_invite(), call.callee_addr()) else {
        return;
    };

    let cseq = outbound
        .header("CSeq")
        .and_then(|c| cseq_number(c).ok())
        .unwrap_or(1);
    let mut cancel = build_request(
        Method::Cancel,
        outbound.uri.as_deref().unwrap_or_default(),
        outbound.header("From").unwrap_or_default(),
        outbound.header("To").unwrap_or_default(),
        call.call_id(),
        cseq,
        None,
    );
    if let Some(via) = outbound.header("Via") {
        cancel.set_header("Via", via);
    }
    ctx.sender.send(&mut cancel, callee_addr).await;
    info!(call_id = %call.call_id(), to_ext = %call.to_extension(), "sent CANCEL to callee");
}

/// Answer the caller with a 200 OK whose SDP points at our relay port,
/// so their audio starts flowing into the voicemail sink.
async fn answer_for_voicemail(ctx: &Arc<EngineContext>, call: &Arc<Call>) -> bool {
    let (Some(original), Some(caller_addr), Some(ports)) =
        (call.original_invite(), call.caller_addr(), call.rtp_ports())
    else {
        return false;
    };

    let dtmf = &ctx.config.sip.dtmf;
    let caller_codecs = caller_codec_list(call, dtmf.payload_type);
    let caller_model =
        detect_phone_model(ctx.registry.user_agent_of(call.from_extension()).as_deref());
    let codecs = codecs_for_model(caller_model, &caller_codecs);

    let sdp = build_audio_sdp(
        &ctx.server_ip,
        ports.rtp,
        call.call_id(),
        &codecs,
        dtmf.payload_type,
        dtmf.ilbc_mode,
    );

    let mut ok = build_response(200, "OK", &original, Some(&sdp));
    ok.set_header("Content-Type", "application/sdp");
    ok.set_header(
        "Contact",
        format!(
            "<sip:{}@{}:{}>",
            call.to_extension(),
            ctx.server_ip,
            ctx.sip_port()
        ),
    );
    ctx.sender.send(&mut ok, caller_addr).await;

    ctx.calls.connect_call(call);
    info!(call_id = %call.call_id(), "answered caller for voicemail recording");
    true
}

/// The caller's offered codecs, with the telephone-event payload type
/// filtered out (the SDP builder re-adds it).
fn caller_codec_list(call: &Arc<Call>, dtmf_payload_type: u8) -> Vec<u8> {
    call.caller_media()
        .map(|m| {
            m.formats
                .iter()
                .copied()
                .filter(|&pt| pt != dtmf_payload_type)
                .collect()
        })
        .unwrap_or_default()
}

/// An SDP media description as a socket address, when the address
/// parses.
pub fn media_endpoint(media: &tandem_sip_core::MediaInfo) -> Option<SocketAddr> {
    media
        .address
        .parse()
        .ok()
        .map(|ip| SocketAddr::new(ip, media.port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DialplanConfig;

    fn dialplan() -> Dialplan {
        Dialplan::compile(&DialplanConfig::default()).unwrap()
    }

    #[test]
    fn default_dialplan_categories() {
        let plan = dialplan();
        assert!(plan.allows("1001"), "internal");
        assert!(plan.allows("2500"), "conference");
        assert!(plan.allows("*1001"), "voicemail");
        assert!(plan.allows("8001"), "queue");
        assert!(plan.allows("70"), "parking");
        assert!(plan.allows("0"), "auto-attendant");
        assert!(plan.allows("911"), "emergency");

        assert!(!plan.allows("5001"));
        assert!(!plan.allows("10011"));
        assert!(!plan.allows("abc"));
    }

    #[test]
    fn emergency_pattern_accepts_legacy_prefixes() {
        let plan = dialplan();
        assert!(plan.is_emergency("911"));
        assert!(plan.is_emergency("9911"));
        assert!(plan.is_emergency("9-911"));
        assert!(!plan.is_emergency("911x"));
        assert!(!plan.is_emergency("19111"));
    }

    #[test]
    fn media_endpoint_parses_sdp_info() {
        let media = tandem_sip_core::MediaInfo {
            address: "10.0.0.2".to_string(),
            port: 40000,
            formats: vec![0, 8],
        };
        assert_eq!(
            media_endpoint(&media),
            Some("10.0.0.2:40000".parse().unwrap())
        );

        let bad = tandem_sip_core::MediaInfo {
            address: "phone.local".to_string(),
            port: 40000,
            formats: vec![],
        };
        assert_eq!(media_endpoint(&bad), None);
    }
}
