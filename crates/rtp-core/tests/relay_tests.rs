//! End-to-end relay scenarios over loopback sockets: NAT-style endpoint
//! learning, early media before the callee answers, and interleaved
//! bidirectional QoS accounting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use tandem_rtp_core::{Direction, QosMonitor, RelayAllocator, RtpHeader};

fn rtp_packet(sequence: u16, timestamp: u32, fill: u8) -> Vec<u8> {
    RtpHeader {
        sequence,
        timestamp,
        ..Default::default()
    }
    .build_packet(&[fill; 160])
}

async fn bind_endpoint() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn recv_with_timeout(socket: &UdpSocket) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 2048];
    match timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

fn relay_addr(rtp_port: u16) -> SocketAddr {
    format!("127.0.0.1:{rtp_port}").parse().unwrap()
}

/// Symmetric RTP: the SDP advertises NATed private addresses, actual
/// traffic arrives from different ones. The relay learns the real
/// endpoints from the first packets and forwards between them.
#[tokio::test]
async fn symmetric_rtp_learns_real_endpoints() {
    let allocator = RelayAllocator::new(43000, 43100, Arc::new(QosMonitor::default()));
    let ports = allocator.allocate("nat-call").await.unwrap();
    let relay = relay_addr(ports.rtp);

    // What the phones put in SDP (unreachable here, as behind NAT)
    allocator
        .set_endpoints(
            "nat-call",
            Some("192.168.1.10:5000".parse().unwrap()),
            Some("192.168.1.20:5001".parse().unwrap()),
        )
        .unwrap();

    let (sock_a, addr_a) = bind_endpoint().await;
    let (sock_b, addr_b) = bind_endpoint().await;

    // First packets teach the relay the real source addresses
    sock_a.send_to(&rtp_packet(1, 0, b'A'), relay).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    let handler = allocator.handler("nat-call").unwrap();
    assert_eq!(handler.learned_a(), Some(addr_a));

    sock_b.send_to(&rtp_packet(1, 0, b'B'), relay).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.learned_b(), Some(addr_b));

    // Now traffic crosses over, and never echoes back to its sender
    sock_a.send_to(&rtp_packet(2, 160, b'A'), relay).await.unwrap();
    let at_b = recv_with_timeout(&sock_b).await.expect("B should hear A");
    assert_eq!(at_b[12], b'A');

    sock_b.send_to(&rtp_packet(2, 160, b'B'), relay).await.unwrap();
    let at_a = recv_with_timeout(&sock_a).await.expect("A should hear B");
    assert_eq!(at_a[12], b'B');

    // A third party is not part of the call
    let (sock_c, _) = bind_endpoint().await;
    sock_c.send_to(&rtp_packet(1, 0, b'C'), relay).await.unwrap();
    assert!(recv_with_timeout(&sock_a).await.is_none());
    assert!(recv_with_timeout(&sock_b).await.is_none());

    allocator.release("nat-call");
}

/// Early media: the caller's RTP arrives before the callee has answered.
/// The packet cannot be forwarded yet but must still teach the relay the
/// caller's endpoint rather than being treated as unknown.
#[tokio::test]
async fn early_rtp_is_learned_not_dropped() {
    let allocator = RelayAllocator::new(43200, 43300, Arc::new(QosMonitor::default()));
    let ports = allocator.allocate("early-call").await.unwrap();
    let relay = relay_addr(ports.rtp);

    // Only the caller's SDP endpoint is known pre-answer
    allocator
        .set_endpoints("early-call", Some("192.168.1.10:5000".parse().unwrap()), None)
        .unwrap();

    let (sock_a, addr_a) = bind_endpoint().await;
    let (sock_b, addr_b) = bind_endpoint().await;

    sock_a.send_to(&rtp_packet(1, 0, b'A'), relay).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let handler = allocator.handler("early-call").unwrap();
    assert_eq!(handler.learned_a(), Some(addr_a), "early packet must teach endpoint A");
    assert_eq!(handler.learned_b(), None);

    // 200 OK arrives: the callee endpoint is patched in, A's preserved
    allocator.set_endpoints("early-call", None, Some(addr_b)).unwrap();

    sock_a.send_to(&rtp_packet(2, 160, b'A'), relay).await.unwrap();
    let at_b = recv_with_timeout(&sock_b).await.expect("post-answer packet should flow");
    assert_eq!(at_b[12], b'A');

    allocator.release("early-call");
}

/// Interleaved bidirectional flows: each party numbers packets from its
/// own sequence space, and neither direction may report the other's
/// numbering as loss.
#[tokio::test]
async fn interleaved_directions_report_no_false_loss() {
    let allocator = RelayAllocator::new(43400, 43500, Arc::new(QosMonitor::default()));
    let ports = allocator.allocate("duplex-call").await.unwrap();
    let relay = relay_addr(ports.rtp);

    let (sock_a, addr_a) = bind_endpoint().await;
    let (sock_b, addr_b) = bind_endpoint().await;
    allocator.set_endpoints("duplex-call", Some(addr_a), Some(addr_b)).unwrap();

    for i in 0..50u16 {
        let ts = u32::from(i) * 160;
        sock_a
            .send_to(&rtp_packet(1000 + i, 160_000 + ts, b'A'), relay)
            .await
            .unwrap();
        sock_b
            .send_to(&rtp_packet(500 + i, 80_000 + ts, b'B'), relay)
            .await
            .unwrap();
    }

    // Let the relay drain both flows
    sleep(Duration::from_millis(500)).await;

    let summaries = allocator.release("duplex-call").unwrap();
    for summary in &summaries {
        let direction = summary.direction;
        assert_eq!(summary.packets_received, 50, "{direction}");
        assert_eq!(summary.packets_lost, 0, "{direction}");
        assert_eq!(summary.packet_loss_percentage, 0.0, "{direction}");
        assert!(
            summary.mos_score >= 4.0,
            "{direction} mos = {}",
            summary.mos_score
        );
    }

    let a_to_b = summaries.iter().find(|s| s.direction == Direction::AToB).unwrap();
    assert_eq!(a_to_b.packets_sent, 50);
}

/// Ports go back to the pool when a call ends, lowest-first ordering
/// preserved across the allocate/release cycle.
#[tokio::test]
async fn port_pair_lifecycle() {
    let allocator = RelayAllocator::new(43600, 43610, Arc::new(QosMonitor::default()));
    let before = allocator.available();

    let ports = allocator.allocate("short-call").await.unwrap();
    assert_eq!(ports.rtcp, ports.rtp + 1);
    assert_eq!(allocator.available(), before - 1);

    allocator.release("short-call");
    assert_eq!(allocator.available(), before);

    // The same lowest pair is handed out again
    let again = allocator.allocate("next-call").await.unwrap();
    assert_eq!(again, ports);
    allocator.release("next-call");
}
