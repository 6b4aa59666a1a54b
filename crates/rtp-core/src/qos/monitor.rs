//! Call quality aggregation and threshold alerting
//!
//! The monitor owns the per-call metric records for the lifetime of each
//! call, keeps a bounded history of finished-call summaries, and raises
//! alerts when a summary crosses the configured thresholds.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{CallQos, QosSummary};

/// Alert thresholds; a summary crossing any of them raises an alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosThresholds {
    /// Alert when MOS drops below this
    #[serde(default = "default_mos_min")]
    pub mos_min: f64,
    /// Alert when packet loss exceeds this percentage
    #[serde(default = "default_loss_max")]
    pub packet_loss_max: f64,
    /// Alert when average jitter exceeds this (ms)
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
    /// Alert when average latency exceeds this (ms)
    #[serde(default = "default_latency_max")]
    pub latency_max: f64,
}

fn default_mos_min() -> f64 {
    3.5
}
fn default_loss_max() -> f64 {
    2.0
}
fn default_jitter_max() -> f64 {
    50.0
}
fn default_latency_max() -> f64 {
    300.0
}

impl Default for QosThresholds {
    fn default() -> Self {
        QosThresholds {
            mos_min: default_mos_min(),
            packet_loss_max: default_loss_max(),
            jitter_max: default_jitter_max(),
            latency_max: default_latency_max(),
        }
    }
}

/// Kinds of quality alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowMos,
    HighPacketLoss,
    HighJitter,
    HighLatency,
}

/// A raised quality alert
#[derive(Debug, Clone, Serialize)]
pub struct QosAlert {
    pub kind: AlertKind,
    pub severity: &'static str,
    pub message: String,
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate statistics over the history buffer
#[derive(Debug, Clone, Serialize)]
pub struct QosStatistics {
    pub total_summaries: usize,
    pub average_mos: f64,
    pub calls_with_issues: usize,
    pub issue_percentage: f64,
    pub total_alerts: usize,
    pub active_calls: usize,
}

/// Bound on the historical summary buffer.
const MAX_HISTORY: usize = 10_000;
/// Bound on the rolling alert buffer.
const MAX_ALERTS: usize = 1000;

/// QoS monitoring across all calls on the PBX
pub struct QosMonitor {
    active: Mutex<HashMap<String, Arc<CallQos>>>,
    history: Mutex<VecDeque<QosSummary>>,
    alerts: Mutex<VecDeque<QosAlert>>,
    thresholds: Mutex<QosThresholds>,
    sample_every: u64,
}

impl QosMonitor {
    pub fn new(thresholds: QosThresholds, sample_every: u64) -> Self {
        QosMonitor {
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(VecDeque::new()),
            thresholds: Mutex::new(thresholds),
            sample_every,
        }
    }

    /// Begin monitoring a call. Idempotent: a second start for the same
    /// call returns the existing records.
    pub fn start_monitoring(&self, call_id: &str) -> Arc<CallQos> {
        let mut active = self.active.lock();
        if let Some(existing) = active.get(call_id) {
            warn!(call_id, "QoS monitoring already active for call");
            return Arc::clone(existing);
        }

        let qos = Arc::new(CallQos::new(call_id, self.sample_every));
        active.insert(call_id.to_string(), Arc::clone(&qos));
        info!(call_id, "started QoS monitoring");
        qos
    }

    /// Stop monitoring a call: settle both directions, append the
    /// summaries to history, run the alert checks, and return the
    /// summaries for persistence.
    pub fn stop_monitoring(&self, call_id: &str) -> Option<Vec<QosSummary>> {
        let qos = self.active.lock().remove(call_id)?;
        let summaries = qos.finish();

        {
            let mut history = self.history.lock();
            for summary in &summaries {
                if history.len() == MAX_HISTORY {
                    history.pop_front();
                }
                history.push_back(summary.clone());
            }
        }

        for summary in &summaries {
            self.check_alerts(summary);
        }

        info!(
            call_id,
            mos_a = summaries[0].mos_score,
            mos_b = summaries[1].mos_score,
            "stopped QoS monitoring"
        );
        Some(summaries)
    }

    /// Current snapshots for an active call.
    pub fn metrics(&self, call_id: &str) -> Option<Vec<QosSummary>> {
        let active = self.active.lock();
        let qos = active.get(call_id)?;
        let summaries = vec![qos.a_to_b.lock().summary(), qos.b_to_a.lock().summary()];
        Some(summaries)
    }

    /// Snapshots for every active call.
    pub fn all_active_metrics(&self) -> Vec<QosSummary> {
        let active = self.active.lock();
        let mut out = Vec::with_capacity(active.len() * 2);
        for qos in active.values() {
            out.push(qos.a_to_b.lock().summary());
            out.push(qos.b_to_a.lock().summary());
        }
        out
    }

    /// The most recent `limit` historical summaries.
    pub fn historical_metrics(&self, limit: usize) -> Vec<QosSummary> {
        let history = self.history.lock();
        history.iter().rev().take(limit).rev().cloned().collect()
    }

    /// The most recent `limit` alerts.
    pub fn alerts(&self, limit: usize) -> Vec<QosAlert> {
        let alerts = self.alerts.lock();
        alerts.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Drop all alerts, returning how many were cleared.
    pub fn clear_alerts(&self) -> usize {
        let mut alerts = self.alerts.lock();
        let count = alerts.len();
        alerts.clear();
        info!(count, "cleared QoS alerts");
        count
    }

    /// Replace the alert thresholds.
    pub fn update_thresholds(&self, thresholds: QosThresholds) {
        *self.thresholds.lock() = thresholds;
    }

    /// Aggregate statistics over the history buffer.
    pub fn statistics(&self) -> QosStatistics {
        let history = self.history.lock();
        let active = self.active.lock().len();
        let alerts = self.alerts.lock().len();
        let mos_min = self.thresholds.lock().mos_min;

        if history.is_empty() {
            return QosStatistics {
                total_summaries: 0,
                average_mos: 0.0,
                calls_with_issues: 0,
                issue_percentage: 0.0,
                total_alerts: alerts,
                active_calls: active,
            };
        }

        let total = history.len();
        let average_mos = history.iter().map(|s| s.mos_score).sum::<f64>() / total as f64;
        let with_issues = history.iter().filter(|s| s.mos_score < mos_min).count();

        QosStatistics {
            total_summaries: total,
            average_mos,
            calls_with_issues: with_issues,
            issue_percentage: with_issues as f64 / total as f64 * 100.0,
            total_alerts: alerts,
            active_calls: active,
        }
    }

    /// Threshold checks for one direction's summary.
    ///
    /// A direction that never received a packet keeps the 0.0 MOS
    /// sentinel, which would otherwise always trip the low-MOS alert, so
    /// summaries without receive data are skipped entirely.
    fn check_alerts(&self, summary: &QosSummary) {
        if summary.packets_received == 0 {
            return;
        }

        let thresholds = self.thresholds.lock().clone();
        let mut raised = Vec::new();

        if summary.mos_score < thresholds.mos_min {
            raised.push(QosAlert {
                kind: AlertKind::LowMos,
                severity: "warning",
                message: format!(
                    "Low MOS score: {:.2} (threshold: {})",
                    summary.mos_score, thresholds.mos_min
                ),
                call_id: summary.call_id.clone(),
                timestamp: Utc::now(),
            });
        }

        if summary.packet_loss_percentage > thresholds.packet_loss_max {
            raised.push(QosAlert {
                kind: AlertKind::HighPacketLoss,
                severity: "error",
                message: format!(
                    "High packet loss: {:.2}% (threshold: {}%)",
                    summary.packet_loss_percentage, thresholds.packet_loss_max
                ),
                call_id: summary.call_id.clone(),
                timestamp: Utc::now(),
            });
        }

        if summary.jitter_avg_ms > thresholds.jitter_max {
            raised.push(QosAlert {
                kind: AlertKind::HighJitter,
                severity: "warning",
                message: format!(
                    "High jitter: {:.2}ms (threshold: {}ms)",
                    summary.jitter_avg_ms, thresholds.jitter_max
                ),
                call_id: summary.call_id.clone(),
                timestamp: Utc::now(),
            });
        }

        if summary.latency_avg_ms > thresholds.latency_max {
            raised.push(QosAlert {
                kind: AlertKind::HighLatency,
                severity: "warning",
                message: format!(
                    "High latency: {:.2}ms (threshold: {}ms)",
                    summary.latency_avg_ms, thresholds.latency_max
                ),
                call_id: summary.call_id.clone(),
                timestamp: Utc::now(),
            });
        }

        let mut alerts = self.alerts.lock();
        for alert in raised {
            warn!(call_id = %alert.call_id, "QoS alert: {}", alert.message);
            if alerts.len() == MAX_ALERTS {
                alerts.pop_front();
            }
            alerts.push_back(alert);
        }
    }
}

impl Default for QosMonitor {
    fn default() -> Self {
        QosMonitor::new(QosThresholds::default(), 10)
    }
}
