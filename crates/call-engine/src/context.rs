//! The engine's capability surface
//!
//! One concrete owner (the engine) composes everything at startup;
//! subsystems get this narrow context instead of a reference to the
//! whole server, which keeps the dependency graph a tree rather than a
//! web of back-pointers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use tandem_infra_common::hooks::{
    AutoAttendant, EmergencyHandler, NullVoicemailPipeline, PagingSystem, StirShakenVerifier,
    VoicemailAccess, VoicemailPipeline,
};
use tandem_infra_common::{CdrSystem, PbxStore, WebhookSystem};
use tandem_registrar_core::{ExtensionRegistry, Registrar};
use tandem_session_core::CallManager;
use tandem_sip_core::SipMessage;

use crate::config::PbxConfig;

/// The pluggable collaborators
pub struct Hooks {
    pub emergency: Option<Arc<dyn EmergencyHandler>>,
    pub auto_attendant: Option<Arc<dyn AutoAttendant>>,
    pub paging: Option<Arc<dyn PagingSystem>>,
    pub voicemail_access: Option<Arc<dyn VoicemailAccess>>,
    pub voicemail: Arc<dyn VoicemailPipeline>,
    pub stir_shaken: Option<Arc<dyn StirShakenVerifier>>,
}

impl Default for Hooks {
    fn default() -> Self {
        Hooks {
            emergency: None,
            auto_attendant: None,
            paging: None,
            voicemail_access: None,
            voicemail: Arc::new(NullVoicemailPipeline),
            stir_shaken: None,
        }
    }
}

/// Sends SIP messages out the server's one socket
#[derive(Clone)]
pub struct SipSender {
    socket: Arc<UdpSocket>,
}

impl SipSender {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        SipSender { socket }
    }

    /// Serialize and send. Send failures are logged, not propagated;
    /// SIP retransmission covers the gap.
    pub async fn send(&self, message: &mut SipMessage, addr: SocketAddr) {
        let wire = message.build();
        self.send_raw(&wire, addr).await;
    }

    pub async fn send_raw(&self, wire: &str, addr: SocketAddr) {
        match self.socket.send_to(wire.as_bytes(), addr).await {
            Ok(_) => debug!(%addr, len = wire.len(), "sent SIP message"),
            Err(e) => warn!(%addr, error = %e, "failed to send SIP message"),
        }
    }
}

/// Capabilities shared by the transaction layer, router and timers
pub struct EngineContext {
    pub config: Arc<PbxConfig>,
    /// The address phones reach us at; written into SDP, Contact and
    /// identity headers
    pub server_ip: String,
    pub registry: Arc<ExtensionRegistry>,
    pub registrar: Arc<Registrar>,
    pub calls: Arc<CallManager>,
    pub cdr: Arc<CdrSystem>,
    pub webhooks: Arc<WebhookSystem>,
    pub store: Option<Arc<dyn PbxStore>>,
    pub hooks: Hooks,
    pub sender: SipSender,
    draining: AtomicBool,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<PbxConfig>,
        server_ip: String,
        registry: Arc<ExtensionRegistry>,
        registrar: Arc<Registrar>,
        calls: Arc<CallManager>,
        cdr: Arc<CdrSystem>,
        webhooks: Arc<WebhookSystem>,
        store: Option<Arc<dyn PbxStore>>,
        hooks: Hooks,
        sender: SipSender,
    ) -> Self {
        EngineContext {
            config,
            server_ip,
            registry,
            registrar,
            calls,
            cdr,
            webhooks,
            store,
            hooks,
            sender,
            draining: AtomicBool::new(false),
        }
    }

    /// New INVITEs are refused once draining begins.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// The SIP port we advertise in Contact headers.
    pub fn sip_port(&self) -> u16 {
        self.config.server.sip_port
    }
}
