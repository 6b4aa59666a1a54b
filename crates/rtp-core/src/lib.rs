//! # tandem-rtp-core
//!
//! Symmetric-RTP media relay for the tandem PBX.
//!
//! The PBX sits in the media path of every call: each call gets one even
//! UDP port pair from the [`RelayAllocator`], and a [`RelayHandler`] task
//! forwards datagrams between the two parties. Endpoints are learned from
//! the first packets actually received (symmetric RTP), because the
//! address a phone advertises in SDP is frequently not the address its
//! packets arrive from once a NAT is involved. Learning is bounded by a
//! window (10 s by default) after which packets from unrecognised sources
//! are dropped.
//!
//! Each direction of a call carries its own [`qos::QosMetrics`] record;
//! tracking both directions in one record was the classic source of false
//! packet-loss readings, since the two parties draw sequence numbers from
//! independent spaces. The [`qos::QosMonitor`] aggregates summaries,
//! keeps bounded history and raises threshold alerts.

pub mod alloc;
pub mod error;
pub mod packet;
pub mod qos;
pub mod relay;

pub use alloc::{PortPair, RelayAllocator};
pub use error::{Error, Result};
pub use packet::RtpHeader;
pub use qos::{
    CallQos, Direction, QosAlert, QosMetrics, QosMonitor, QosStatistics, QosSummary,
    QosThresholds,
};
pub use relay::RelayHandler;
