//! Composition root and lifecycle
//!
//! `PbxEngine::start` owns construction order: detect the advertised
//! address, bind the SIP socket, build the QoS monitor, relay
//! allocator, CDR, call manager, registry and registrar, run the
//! registrar's boot reset (fail fast if the store is unusable), then
//! start the server and background tasks. Shutdown runs the same in
//! reverse with a drain grace period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tandem_infra_common::events::LogSink;
use tandem_infra_common::{CdrSystem, PbxStore, WebhookSystem};
use tandem_registrar_core::{ExtensionRegistry, Registrar, RegistrarConfig};
use tandem_rtp_core::{QosMonitor, RelayAllocator};
use tandem_session_core::{CallManager, CallState, EndReason};

use crate::config::PbxConfig;
use crate::context::{EngineContext, Hooks, SipSender};
use crate::router::Router;
use crate::server::SipServer;

/// A running PBX
pub struct PbxEngine {
    ctx: Arc<EngineContext>,
    server: Arc<SipServer>,
    local_addr: SocketAddr,
    server_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl PbxEngine {
    /// Bring the PBX up. Store failures here are fatal: a server that
    /// cannot read its extension table should exit non-zero rather than
    /// answer calls wrong.
    pub async fn start(
        config: PbxConfig,
        store: Option<Arc<dyn PbxStore>>,
        hooks: Hooks,
    ) -> anyhow::Result<PbxEngine> {
        let config = Arc::new(config);

        let server_ip = config
            .server
            .external_ip
            .clone()
            .unwrap_or_else(detect_server_ip);

        let socket = UdpSocket::bind(("0.0.0.0", config.server.sip_port))
            .await
            .with_context(|| format!("binding SIP port {}", config.server.sip_port))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let monitor = Arc::new(QosMonitor::new(
            config.qos.thresholds.clone(),
            config.qos.sample_every,
        ));
        let allocator = Arc::new(RelayAllocator::new(
            config.server.rtp_port_start,
            config.server.rtp_port_end,
            monitor,
        ));

        let mut webhooks = WebhookSystem::new();
        webhooks.add_sink(Arc::new(LogSink));
        let webhooks = Arc::new(webhooks);

        let cdr = Arc::new(CdrSystem::new(store.clone()));
        let calls = Arc::new(CallManager::new(
            Arc::clone(&webhooks),
            Arc::clone(&cdr),
            allocator,
            store.clone(),
        ));

        let registry = Arc::new(ExtensionRegistry::new());
        let registrar = Arc::new(Registrar::new(
            Arc::clone(&registry),
            store.clone(),
            Arc::clone(&webhooks),
            RegistrarConfig {
                auth_mode: config.sip.auth.mode,
                realm: config.sip.auth.realm.clone(),
                ..Default::default()
            },
        ));
        registrar.boot().await.context("registrar boot")?;
        let sweep = registrar.start_expiry_sweep();

        let router = Router::new(&config.dialplan).context("compiling dialplan")?;
        let sender = SipSender::new(Arc::clone(&socket));

        let ctx = Arc::new(EngineContext::new(
            Arc::clone(&config),
            server_ip.clone(),
            registry,
            registrar,
            calls,
            cdr,
            webhooks,
            store,
            hooks,
            sender,
        ));

        let server = SipServer::new(Arc::clone(&ctx), socket, router);
        let server_task = tokio::spawn(Arc::clone(&server).run());

        info!(%local_addr, %server_ip, "tandem PBX started");
        Ok(PbxEngine {
            ctx,
            server,
            local_addr,
            server_task: Mutex::new(Some(server_task)),
            sweep_task: Mutex::new(Some(sweep)),
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// The bound SIP address (useful when the configured port was 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Graceful shutdown: refuse new INVITEs, give active calls the
    /// configured grace period, then force-end what remains, send BYEs
    /// so phones stop, and take the tasks down.
    pub async fn shutdown(&self) {
        info!("shutdown requested; draining new calls");
        self.ctx.begin_drain();

        let grace = Duration::from_secs(self.ctx.config.shutdown.grace_period);
        let deadline = Instant::now() + grace;
        while self.ctx.calls.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let remaining = self.ctx.calls.all_calls();
        if !remaining.is_empty() {
            warn!(count = remaining.len(), "grace period over; force-ending calls");
        }
        for call in remaining {
            let call_id = call.call_id().to_string();
            if call.state() == CallState::Connected {
                if let Some(addr) = call.caller_addr() {
                    self.server.send_bye_to_peer(&call, addr).await;
                }
                if let Some(addr) = call.callee_addr() {
                    if !call.routed_to_voicemail() {
                        self.server.send_bye_to_peer(&call, addr).await;
                    }
                }
            }
            self.ctx.calls.end_call(&call_id, EndReason::Shutdown).await;
        }

        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
        self.server.stop();
        if let Some(task) = self.server_task.lock().take() {
            // The reader observes the stop flag within its receive
            // timeout; abort only covers a task already past it
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        info!("shutdown complete");
    }
}

/// Best-effort detection of the address phones should reach us at:
/// the local address of a routed (never sent) probe.
fn detect_server_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
