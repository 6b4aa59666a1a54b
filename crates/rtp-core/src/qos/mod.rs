//! Per-direction call quality metrics
//!
//! Loss, reordering, jitter and latency are tracked per direction of a
//! call, in the RFC 3550 section 6.4.1 sense, and folded into a MOS
//! estimate via the simplified ITU-T E-Model. Sequence accounting runs on
//! every packet (cheap integer work); jitter and MOS recomputation are
//! sampled to bound CPU on the forwarding path.

pub mod monitor;

pub use monitor::{QosAlert, QosMonitor, QosStatistics, QosThresholds};

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Bound on the jitter / latency sliding windows.
const SAMPLE_WINDOW: usize = 100;

/// Relay direction, named from the caller's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Caller to callee
    AToB,
    /// Callee to caller
    BToA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => f.write_str("a_to_b"),
            Direction::BToA => f.write_str("b_to_a"),
        }
    }
}

/// Snapshot of one direction's metrics
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QosSummary {
    pub call_id: String,
    pub direction: Direction,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_out_of_order: u64,
    pub packet_loss_percentage: f64,
    pub jitter_avg_ms: f64,
    pub jitter_max_ms: f64,
    pub latency_avg_ms: f64,
    pub latency_max_ms: f64,
    /// 1.0-5.0, or the 0.0 sentinel when no data was ever received
    pub mos_score: f64,
    pub quality_rating: &'static str,
}

/// Counters and sample windows for one direction of one call
#[derive(Debug)]
pub struct QosMetrics {
    call_id: String,
    direction: Direction,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,

    packets_sent: u64,
    packets_received: u64,
    packets_lost: u64,
    packets_out_of_order: u64,

    jitter_samples: VecDeque<f64>,
    jitter_sum: f64,
    latency_samples: VecDeque<f64>,
    max_jitter: f64,
    avg_jitter: f64,
    max_latency: f64,
    avg_latency: f64,

    last_sequence: Option<u16>,
    expected_sequence: Option<u16>,
    last_rtp_timestamp: Option<u32>,
    last_arrival: Option<Instant>,

    mos_score: f64,

    /// Codec clock in kHz; 8 kHz for the telephony codecs this PBX offers
    clock_rate_khz: f64,
    /// Recompute jitter and MOS every Nth received packet
    sample_every: u64,
}

impl QosMetrics {
    pub fn new(call_id: &str, direction: Direction, sample_every: u64) -> Self {
        QosMetrics {
            call_id: call_id.to_string(),
            direction,
            start_time: Utc::now(),
            end_time: None,
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
            packets_out_of_order: 0,
            jitter_samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            jitter_sum: 0.0,
            latency_samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            max_jitter: 0.0,
            avg_jitter: 0.0,
            max_latency: 0.0,
            avg_latency: 0.0,
            last_sequence: None,
            expected_sequence: None,
            last_rtp_timestamp: None,
            last_arrival: None,
            mos_score: 0.0,
            clock_rate_khz: 8.0,
            sample_every: sample_every.max(1),
        }
    }

    /// Record a received packet.
    ///
    /// Sequence-gap analysis and the jitter window run on every call with
    /// O(1) work; the MOS polynomial is recomputed on every
    /// `sample_every`th packet (and at end of call) to bound CPU on the
    /// forwarding hot path.
    pub fn update_packet_received(&mut self, sequence: u16, rtp_timestamp: u32, _payload_len: usize) {
        self.packets_received += 1;
        let now = Instant::now();

        let (Some(last_seq), Some(expected)) = (self.last_sequence, self.expected_sequence) else {
            self.last_sequence = Some(sequence);
            self.expected_sequence = Some(sequence.wrapping_add(1));
            self.last_rtp_timestamp = Some(rtp_timestamp);
            self.last_arrival = Some(now);
            return;
        };

        if sequence != expected {
            if sequence > expected {
                self.packets_lost += u64::from(sequence - expected);
            } else if sequence < last_seq {
                self.packets_out_of_order += 1;
            }
        }

        // Interarrival jitter: |arrival delta - media clock delta|
        if let (Some(last_arrival), Some(last_ts)) = (self.last_arrival, self.last_rtp_timestamp) {
            let arrival_delta_ms = now.duration_since(last_arrival).as_secs_f64() * 1000.0;
            let timestamp_delta_ms = rtp_timestamp.wrapping_sub(last_ts) as f64 / self.clock_rate_khz;
            let jitter = (arrival_delta_ms - timestamp_delta_ms).abs();

            if self.jitter_samples.len() == SAMPLE_WINDOW {
                if let Some(evicted) = self.jitter_samples.pop_front() {
                    self.jitter_sum -= evicted;
                }
            }
            self.jitter_samples.push_back(jitter);
            self.jitter_sum += jitter;
            if jitter > self.max_jitter {
                self.max_jitter = jitter;
            }
            self.avg_jitter = self.jitter_sum / self.jitter_samples.len() as f64;
        }

        self.last_sequence = Some(sequence);
        self.expected_sequence = Some(sequence.wrapping_add(1));
        self.last_rtp_timestamp = Some(rtp_timestamp);
        self.last_arrival = Some(now);

        if self.packets_received % self.sample_every == 0 {
            self.recalculate_mos();
        }
    }

    /// Record a forwarded packet. Unconditional, unlike receive sampling.
    pub fn update_packet_sent(&mut self) {
        self.packets_sent += 1;
    }

    /// Record an externally-measured round-trip latency sample.
    pub fn add_latency_sample(&mut self, latency_ms: f64) {
        if self.latency_samples.len() == SAMPLE_WINDOW {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
        if latency_ms > self.max_latency {
            self.max_latency = latency_ms;
        }
        self.avg_latency =
            self.latency_samples.iter().sum::<f64>() / self.latency_samples.len() as f64;
        self.recalculate_mos();
    }

    /// Mark the direction finished and settle the final MOS.
    pub fn end_call(&mut self) {
        self.end_time = Some(Utc::now());
        self.recalculate_mos();
    }

    /// Simplified E-Model (ITU-T G.107).
    ///
    /// With no received packets and no latency samples the score stays at
    /// the 0.0 "no data" sentinel, which is distinct from the worst valid
    /// score of 1.0.
    fn recalculate_mos(&mut self) {
        if self.packets_received == 0 && self.latency_samples.is_empty() {
            return;
        }

        let mut r_factor = 93.2;

        if self.packets_received > 0 {
            let total = (self.packets_received + self.packets_lost) as f64;
            let loss_pct = self.packets_lost as f64 / total * 100.0;
            r_factor -= loss_pct * 2.5;
        }

        if !self.latency_samples.is_empty() {
            // Samples are round trips; the E-Model wants one-way delay
            let one_way = self.avg_latency / 2.0;
            if one_way > 160.0 {
                r_factor -= (one_way - 160.0) * 0.3;
            }
        }

        if !self.jitter_samples.is_empty() && self.avg_jitter > 30.0 {
            r_factor -= (self.avg_jitter - 30.0) * 0.1;
        }

        self.mos_score = if r_factor < 0.0 {
            1.0
        } else if r_factor > 100.0 {
            4.5
        } else {
            let mos = 1.0
                + 0.035 * r_factor
                + 0.000_007 * r_factor * (r_factor - 60.0) * (100.0 - r_factor);
            mos.clamp(1.0, 4.5)
        };
    }

    /// Produce a snapshot of the current state.
    pub fn summary(&self) -> QosSummary {
        let end = self.end_time.unwrap_or_else(Utc::now);
        let duration = (end - self.start_time).num_milliseconds() as f64 / 1000.0;

        let total = self.packets_received + self.packets_lost;
        let loss_pct = if total > 0 {
            self.packets_lost as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        QosSummary {
            call_id: self.call_id.clone(),
            direction: self.direction,
            start_time: self.start_time,
            end_time: self.end_time,
            duration_seconds: duration,
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            packets_lost: self.packets_lost,
            packets_out_of_order: self.packets_out_of_order,
            packet_loss_percentage: loss_pct,
            jitter_avg_ms: self.avg_jitter,
            jitter_max_ms: self.max_jitter,
            latency_avg_ms: self.avg_latency,
            latency_max_ms: self.max_latency,
            mos_score: self.mos_score,
            quality_rating: quality_rating(self.mos_score),
        }
    }
}

/// MOS bucket labels used in summaries and reports.
pub fn quality_rating(mos: f64) -> &'static str {
    if mos >= 4.3 {
        "Excellent"
    } else if mos >= 4.0 {
        "Good"
    } else if mos >= 3.6 {
        "Fair"
    } else if mos >= 3.1 {
        "Poor"
    } else {
        "Bad"
    }
}

/// Both directions of one call's metrics, shared between the relay
/// handler and the monitor.
#[derive(Debug)]
pub struct CallQos {
    pub a_to_b: Mutex<QosMetrics>,
    pub b_to_a: Mutex<QosMetrics>,
}

impl CallQos {
    pub fn new(call_id: &str, sample_every: u64) -> Self {
        CallQos {
            a_to_b: Mutex::new(QosMetrics::new(call_id, Direction::AToB, sample_every)),
            b_to_a: Mutex::new(QosMetrics::new(call_id, Direction::BToA, sample_every)),
        }
    }

    /// The metrics record for packets flowing out of `direction`'s source.
    pub fn direction(&self, direction: Direction) -> &Mutex<QosMetrics> {
        match direction {
            Direction::AToB => &self.a_to_b,
            Direction::BToA => &self.b_to_a,
        }
    }

    /// Settle both directions and return their final summaries.
    pub fn finish(&self) -> Vec<QosSummary> {
        let mut a = self.a_to_b.lock();
        let mut b = self.b_to_a.lock();
        a.end_call();
        b.end_call();
        vec![a.summary(), b.summary()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_sequences_report_no_loss() {
        let mut metrics = QosMetrics::new("call-1", Direction::AToB, 10);
        for i in 0..50u16 {
            metrics.update_packet_received(1000 + i, 160_000 + u32::from(i) * 160, 160);
        }
        let summary = metrics.summary();
        assert_eq!(summary.packets_received, 50);
        assert_eq!(summary.packets_lost, 0);
        assert_eq!(summary.packet_loss_percentage, 0.0);
    }

    #[test]
    fn sequence_gap_counts_lost_packets() {
        let mut metrics = QosMetrics::new("call-2", Direction::AToB, 1);
        metrics.update_packet_received(100, 0, 160);
        metrics.update_packet_received(101, 160, 160);
        // 102..=104 never arrive
        metrics.update_packet_received(105, 800, 160);
        assert_eq!(metrics.summary().packets_lost, 3);
    }

    #[test]
    fn reordered_packet_counts_once() {
        let mut metrics = QosMetrics::new("call-3", Direction::AToB, 1);
        metrics.update_packet_received(100, 0, 160);
        metrics.update_packet_received(102, 320, 160);
        metrics.update_packet_received(101, 160, 160);
        let summary = metrics.summary();
        assert_eq!(summary.packets_out_of_order, 1);
    }

    #[test]
    fn clean_stream_scores_good_mos() {
        let mut metrics = QosMetrics::new("call-4", Direction::AToB, 10);
        for i in 0..100u16 {
            metrics.update_packet_received(i, u32::from(i) * 160, 160);
        }
        metrics.end_call();
        let summary = metrics.summary();
        assert!(summary.mos_score >= 4.0, "mos = {}", summary.mos_score);
        assert!(matches!(summary.quality_rating, "Good" | "Excellent"));
    }

    #[test]
    fn no_data_keeps_sentinel_mos() {
        let mut metrics = QosMetrics::new("call-5", Direction::BToA, 10);
        metrics.end_call();
        assert_eq!(metrics.summary().mos_score, 0.0);
    }

    #[test]
    fn heavy_loss_drags_mos_down() {
        let mut metrics = QosMetrics::new("call-6", Direction::AToB, 1);
        // Every other packet missing: 50% loss
        for i in (0..100u16).step_by(2) {
            metrics.update_packet_received(i, u32::from(i) * 160, 160);
        }
        metrics.end_call();
        let summary = metrics.summary();
        assert!(summary.packet_loss_percentage > 40.0);
        assert!(summary.mos_score <= 3.1, "mos = {}", summary.mos_score);
    }

    #[test]
    fn high_latency_penalises_mos() {
        let mut with_latency = QosMetrics::new("call-7", Direction::AToB, 1);
        with_latency.update_packet_received(0, 0, 160);
        with_latency.update_packet_received(1, 160, 160);
        for _ in 0..10 {
            with_latency.add_latency_sample(800.0);
        }
        let score = with_latency.summary().mos_score;
        assert!(score < 4.0, "mos = {score}");
        assert!(score >= 1.0);
    }

    #[test]
    fn directions_are_independent() {
        let qos = CallQos::new("call-8", 1);
        for i in 0..50u16 {
            qos.direction(Direction::AToB)
                .lock()
                .update_packet_received(1000 + i, u32::from(i) * 160, 160);
            qos.direction(Direction::BToA)
                .lock()
                .update_packet_received(500 + i, u32::from(i) * 160, 160);
        }
        let summaries = qos.finish();
        for summary in &summaries {
            assert_eq!(summary.packets_received, 50, "{}", summary.direction);
            assert_eq!(summary.packets_lost, 0, "{}", summary.direction);
        }
    }
}
