//! The per-call RTP relay handler
//!
//! One handler owns one bound UDP socket and forwards datagrams between
//! the two parties of a call. Parties are identified by source address,
//! preferring the learned (actually observed) endpoint over the one
//! advertised in SDP; unknown sources may claim an unfilled learned slot
//! only within the learning window. All of parse, classify, forward and
//! QoS accounting happen in-line in the single reader task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::packet::{RtpHeader, RTP_HEADER_LEN};
use crate::qos::{CallQos, Direction};

/// How long after relay start unknown sources may claim a learned slot.
pub const LEARNING_WINDOW: Duration = Duration::from_secs(10);

/// Receive timeout so `stop` is observed promptly.
const RECV_TIMEOUT: Duration = Duration::from_millis(200);

/// The four endpoint slots, guarded together.
#[derive(Debug, Default, Clone, Copy)]
struct EndpointSlots {
    sdp_a: Option<SocketAddr>,
    sdp_b: Option<SocketAddr>,
    learned_a: Option<SocketAddr>,
    learned_b: Option<SocketAddr>,
}

/// Bidirectional forwarder for one call
pub struct RelayHandler {
    call_id: String,
    rtp_port: u16,
    socket: Arc<UdpSocket>,
    slots: Mutex<EndpointSlots>,
    qos: Arc<CallQos>,
    running: AtomicBool,
    started_at: Instant,
    learning_window: Duration,
}

impl RelayHandler {
    pub fn new(
        socket: UdpSocket,
        rtp_port: u16,
        call_id: &str,
        qos: Arc<CallQos>,
        learning_window: Duration,
    ) -> Self {
        RelayHandler {
            call_id: call_id.to_string(),
            rtp_port,
            socket: Arc::new(socket),
            slots: Mutex::new(EndpointSlots::default()),
            qos,
            running: AtomicBool::new(true),
            started_at: Instant::now(),
            learning_window,
        }
    }

    /// The RTP port this handler is bound on.
    pub fn rtp_port(&self) -> u16 {
        self.rtp_port
    }

    /// Both directions' QoS records.
    pub fn qos(&self) -> &Arc<CallQos> {
        &self.qos
    }

    /// Learned endpoint for side A, once a packet has claimed it.
    pub fn learned_a(&self) -> Option<SocketAddr> {
        self.slots.lock().learned_a
    }

    /// Learned endpoint for side B.
    pub fn learned_b(&self) -> Option<SocketAddr> {
        self.slots.lock().learned_b
    }

    /// Update the SDP-declared endpoints.
    ///
    /// A `None` side preserves whatever is already set, so the caller's
    /// endpoint can be installed at INVITE time and the callee's patched
    /// in when the 200 OK arrives. Learned endpoints are untouched.
    pub fn set_endpoints(&self, a: Option<SocketAddr>, b: Option<SocketAddr>) {
        let mut slots = self.slots.lock();
        if a.is_some() {
            slots.sdp_a = a;
        }
        if b.is_some() {
            slots.sdp_b = b;
        }
        debug!(
            call_id = %self.call_id,
            sdp_a = ?slots.sdp_a,
            sdp_b = ?slots.sdp_b,
            "relay endpoints updated"
        );
    }

    /// Stop the relay; the reader task exits on its next timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(call_id = %self.call_id, port = self.rtp_port, "RTP relay handler stopped");
    }

    /// Identify the sender of a datagram and decide where to forward it.
    ///
    /// Returns `None` for unknown third parties (or learning-window
    /// expiry); otherwise the sender's direction and, when the other
    /// side is known, the forward destination. Learning mutates the
    /// handler: the first unknown sources within the window claim the
    /// unfilled slots, and a claimed slot is immutable for the rest of
    /// the call.
    fn classify(&self, src: SocketAddr) -> Option<(Direction, Option<SocketAddr>)> {
        let mut slots = self.slots.lock();
        let within_window = self.started_at.elapsed() < self.learning_window;

        let direction = if slots.learned_a == Some(src)
            || (slots.learned_a.is_none() && slots.sdp_a == Some(src))
        {
            Direction::AToB
        } else if slots.learned_b == Some(src)
            || (slots.learned_b.is_none() && slots.sdp_b == Some(src))
        {
            Direction::BToA
        } else if within_window && slots.learned_a.is_none() {
            slots.learned_a = Some(src);
            info!(call_id = %self.call_id, %src, "learned RTP endpoint A");
            Direction::AToB
        } else if within_window && slots.learned_b.is_none() {
            slots.learned_b = Some(src);
            info!(call_id = %self.call_id, %src, "learned RTP endpoint B");
            Direction::BToA
        } else {
            trace!(call_id = %self.call_id, %src, "dropping RTP from unknown source");
            return None;
        };

        let dest = match direction {
            Direction::AToB => slots.learned_b.or(slots.sdp_b),
            Direction::BToA => slots.learned_a.or(slots.sdp_a),
        };

        Some((direction, dest))
    }

    /// Process one received datagram: classify, account, forward.
    async fn handle_packet(&self, data: &[u8], src: SocketAddr) {
        let Some(header) = RtpHeader::parse(data) else {
            return;
        };

        let Some((direction, dest)) = self.classify(src) else {
            return;
        };

        self.qos.direction(direction).lock().update_packet_received(
            header.sequence,
            header.timestamp,
            data.len() - RTP_HEADER_LEN,
        );

        // An early packet identifies (and may teach) its side even when
        // the other side is still unknown; only forwarding must wait.
        let Some(dest) = dest else {
            return;
        };

        if self.socket.send_to(data, dest).await.is_ok() {
            self.qos.direction(direction).lock().update_packet_sent();
            trace!(call_id = %self.call_id, %direction, len = data.len(), "relayed");
        }
    }

    /// Run the reader loop until stopped. One task per handler; no
    /// per-packet spawning, no allocation beyond the receive buffer.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; 2048];
        info!(call_id = %self.call_id, port = self.rtp_port, "RTP relay handler started");

        while self.running.load(Ordering::SeqCst) {
            match tokio::time::timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    if self.running.load(Ordering::SeqCst) {
                        debug!(call_id = %self.call_id, error = %e, "relay receive error");
                    }
                }
                Ok(Ok((len, src))) => {
                    self.handle_packet(&buf[..len], src).await;
                }
            }
        }
    }

    /// Spawn the reader loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    async fn test_handler(window: Duration) -> Arc<RelayHandler> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        Arc::new(RelayHandler::new(
            socket,
            port,
            "classify-test",
            Arc::new(CallQos::new("classify-test", 10)),
            window,
        ))
    }

    #[tokio::test]
    async fn sdp_match_identifies_without_learning() {
        let handler = test_handler(LEARNING_WINDOW).await;
        handler.set_endpoints(Some(addr(5000)), Some(addr(5001)));

        let (direction, dest) = handler.classify(addr(5000)).unwrap();
        assert_eq!(direction, Direction::AToB);
        assert_eq!(dest, Some(addr(5001)));
        assert_eq!(handler.learned_a(), None);
    }

    #[tokio::test]
    async fn unknown_sources_claim_slots_in_order() {
        let handler = test_handler(LEARNING_WINDOW).await;
        handler.set_endpoints(Some(addr(5000)), Some(addr(5001)));

        // NATed sources differ from the SDP addresses
        let (dir_a, _) = handler.classify(addr(45000)).unwrap();
        assert_eq!(dir_a, Direction::AToB);
        assert_eq!(handler.learned_a(), Some(addr(45000)));

        let (dir_b, dest_b) = handler.classify(addr(45001)).unwrap();
        assert_eq!(dir_b, Direction::BToA);
        assert_eq!(handler.learned_b(), Some(addr(45001)));
        // B's traffic goes to the learned A, not the SDP address
        assert_eq!(dest_b, Some(addr(45000)));
    }

    #[tokio::test]
    async fn learned_endpoints_are_immutable() {
        let handler = test_handler(LEARNING_WINDOW).await;
        handler.classify(addr(45000));
        handler.classify(addr(45001));

        // A third party cannot displace either slot
        assert!(handler.classify(addr(45099)).is_none());
        assert_eq!(handler.learned_a(), Some(addr(45000)));
        assert_eq!(handler.learned_b(), Some(addr(45001)));
    }

    #[tokio::test]
    async fn learning_stops_after_window() {
        let handler = test_handler(Duration::from_millis(0)).await;
        handler.set_endpoints(Some(addr(5000)), None);

        // Window already expired: SDP matches still work, learning does not
        assert!(handler.classify(addr(5000)).is_some());
        assert!(handler.classify(addr(45000)).is_none());
        assert_eq!(handler.learned_b(), None);
    }

    #[tokio::test]
    async fn early_packet_without_other_side_has_no_destination() {
        let handler = test_handler(LEARNING_WINDOW).await;
        handler.set_endpoints(Some(addr(5000)), None);

        let (direction, dest) = handler.classify(addr(45000)).unwrap();
        assert_eq!(direction, Direction::AToB);
        assert_eq!(dest, None);
        assert_eq!(handler.learned_a(), Some(addr(45000)));
    }
}
