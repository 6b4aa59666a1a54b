//! Relay port allocation
//!
//! One even/odd port pair per call from a configurable range. Allocation
//! takes the lowest free port; release re-inserts in sorted order so the
//! allocator's behavior stays predictable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::qos::{QosMonitor, QosSummary};
use crate::relay::{RelayHandler, LEARNING_WINDOW};

/// An allocated RTP/RTCP port pair. RTP on the even port, RTCP on the
/// odd one above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

struct ActiveRelay {
    ports: PortPair,
    handler: Arc<RelayHandler>,
    reader: JoinHandle<()>,
}

/// Port pool and registry of running relay handlers
pub struct RelayAllocator {
    pool: Mutex<Vec<u16>>,
    active: Mutex<HashMap<String, ActiveRelay>>,
    monitor: Arc<QosMonitor>,
    learning_window: Duration,
}

impl RelayAllocator {
    /// A pool over `[range_start, range_end)`, even ports only.
    pub fn new(range_start: u16, range_end: u16, monitor: Arc<QosMonitor>) -> Self {
        let start = range_start + (range_start % 2);
        let pool: Vec<u16> = (start..range_end).step_by(2).collect();
        RelayAllocator {
            pool: Mutex::new(pool),
            active: Mutex::new(HashMap::new()),
            monitor,
            learning_window: LEARNING_WINDOW,
        }
    }

    /// Override the endpoint learning window (tests).
    pub fn with_learning_window(mut self, window: Duration) -> Self {
        self.learning_window = window;
        self
    }

    /// Allocate a port pair for a call and start its relay handler.
    pub async fn allocate(&self, call_id: &str) -> Result<PortPair> {
        let rtp_port = {
            let mut pool = self.pool.lock();
            if pool.is_empty() {
                error!("no available ports for RTP relay");
                return Err(Error::PoolExhausted);
            }
            pool.remove(0)
        };

        let socket = match UdpSocket::bind(("0.0.0.0", rtp_port)).await {
            Ok(socket) => socket,
            Err(source) => {
                warn!(port = rtp_port, error = %source, "relay bind failed");
                self.return_port(rtp_port);
                return Err(Error::Bind { port: rtp_port, source });
            }
        };

        let qos = self.monitor.start_monitoring(call_id);
        let handler = Arc::new(RelayHandler::new(
            socket,
            rtp_port,
            call_id,
            qos,
            self.learning_window,
        ));
        let reader = handler.spawn();

        let ports = PortPair { rtp: rtp_port, rtcp: rtp_port + 1 };
        self.active.lock().insert(
            call_id.to_string(),
            ActiveRelay { ports, handler, reader },
        );

        info!(call_id, rtp = ports.rtp, rtcp = ports.rtcp, "allocated RTP relay");
        Ok(ports)
    }

    /// The running handler for a call.
    pub fn handler(&self, call_id: &str) -> Option<Arc<RelayHandler>> {
        self.active.lock().get(call_id).map(|r| Arc::clone(&r.handler))
    }

    /// Update a call's SDP endpoints; `None` sides are preserved.
    pub fn set_endpoints(
        &self,
        call_id: &str,
        a: Option<std::net::SocketAddr>,
        b: Option<std::net::SocketAddr>,
    ) -> Result<()> {
        let handler = self
            .handler(call_id)
            .ok_or_else(|| Error::UnknownCall(call_id.to_string()))?;
        handler.set_endpoints(a, b);
        Ok(())
    }

    /// Stop a call's relay, return its ports to the pool and hand back
    /// the final QoS summaries for persistence.
    pub fn release(&self, call_id: &str) -> Option<Vec<QosSummary>> {
        let relay = self.active.lock().remove(call_id)?;
        relay.handler.stop();
        relay.reader.abort();
        self.return_port(relay.ports.rtp);

        info!(call_id, rtp = relay.ports.rtp, "released RTP relay");
        self.monitor.stop_monitoring(call_id)
    }

    /// Ports currently free.
    pub fn available(&self) -> usize {
        self.pool.lock().len()
    }

    /// Calls currently relaying.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    fn return_port(&self, port: u16) {
        let mut pool = self.pool.lock();
        let idx = pool.partition_point(|&p| p < port);
        pool.insert(idx, port);
    }
}
