// ABOUTME: Execution monitor raising alerts from pipeline snapshots on a fixed interval
// ABOUTME: Derives a health score and status from alerts inside the retention window

use crate::config::MonitoringConfig;
use crate::pipeline::ExecutionPipeline;
use crate::types::PerformanceMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ALERT_EXECUTION_TIMEOUT: &str = "execution_timeout";
pub const ALERT_LOW_SUCCESS_RATE: &str = "low_success_rate";
pub const ALERT_HIGH_EXECUTION_TIME: &str = "high_execution_time";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    /// Counted as critical when scoring health
    Error,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub score: f64,
    pub last_check: DateTime<Utc>,
    /// Alerts inside the retention window, oldest first
    pub alerts: Vec<Alert>,
    pub metrics: Option<PerformanceMetrics>,
}

#[derive(Default)]
struct MonitorState {
    alerts: VecDeque<Alert>,
    metrics: Option<PerformanceMetrics>,
    last_check: Option<DateTime<Utc>>,
}

struct MonitorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ExecutionMonitor {
    pipeline: Arc<ExecutionPipeline>,
    config: MonitoringConfig,
    state: RwLock<MonitorState>,
    task: Mutex<Option<MonitorTask>>,
}

impl ExecutionMonitor {
    pub fn new(pipeline: Arc<ExecutionPipeline>, config: MonitoringConfig) -> Self {
        Self {
            pipeline,
            config,
            state: RwLock::new(MonitorState::default()),
            task: Mutex::new(None),
        }
    }

    /// Start the background check loop. Starting twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let monitor = Arc::clone(self);
        let loop_token = token.clone();
        let period = self.config.health_check_interval();

        let handle = tokio::spawn(async move {
            info!("Execution monitor started (interval: {:?})", period);
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => monitor.perform_health_check().await,
                }
            }
            info!("Execution monitor stopped");
        });

        *task = Some(MonitorTask { token, handle });
    }

    pub async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        task.token.cancel();
        if let Err(e) = task.handle.await {
            warn!("Execution monitor task ended abnormally: {}", e);
        }
    }

    /// One pass over pipeline snapshots. Never touches pipeline state.
    pub async fn perform_health_check(&self) {
        debug!("Performing execution health check");
        let now = Utc::now();

        let max_execution_time = self.config.max_execution_time();
        for execution in self.pipeline.get_active_executions().await {
            let elapsed = (now - execution.started_at).to_std().unwrap_or_default();
            if elapsed > max_execution_time {
                self.create_alert(
                    ALERT_EXECUTION_TIMEOUT,
                    format!(
                        "Execution {} has exceeded max time: {:?}",
                        execution.trace_id, elapsed
                    ),
                    AlertSeverity::Warning,
                )
                .await;
            }
        }

        let stats = self.pipeline.stats().await;
        if let Some(rate) = stats.success_rate() {
            if rate < self.config.min_success_rate {
                self.create_alert(
                    ALERT_LOW_SUCCESS_RATE,
                    format!("Success rate is low: {:.2}%", rate * 100.0),
                    AlertSeverity::Error,
                )
                .await;
            }
        }

        if stats.average_execution_time > self.config.max_average_execution_time() {
            self.create_alert(
                ALERT_HIGH_EXECUTION_TIME,
                format!(
                    "Average execution time is high: {:?}",
                    stats.average_execution_time
                ),
                AlertSeverity::Warning,
            )
            .await;
        }

        let mut state = self.state.write().await;
        state.metrics = Some(stats);
        state.last_check = Some(now);
    }

    async fn create_alert(&self, alert_type: &str, message: String, severity: AlertSeverity) {
        warn!("Alert: {} - {}", alert_type, message);
        let alert = Alert {
            alert_type: alert_type.to_string(),
            message,
            severity,
            timestamp: Utc::now(),
        };
        self.push_alert(alert).await;
    }

    async fn push_alert(&self, alert: Alert) {
        let mut state = self.state.write().await;
        state.alerts.push_back(alert);
        while state.alerts.len() > self.config.max_alerts {
            state.alerts.pop_front();
        }
    }

    pub async fn health_status(&self) -> HealthStatus {
        let state = self.state.read().await;
        let now = Utc::now();
        let (score, status) = score_alerts(state.alerts.iter(), now, &self.config);

        HealthStatus {
            status,
            score,
            last_check: state.last_check.unwrap_or(now),
            alerts: recent_alerts(state.alerts.iter(), now, &self.config),
            metrics: state.metrics.clone(),
        }
    }

    /// Retained alerts matching `severity` (any when `None`), newest first, at most `limit`
    /// (unbounded when 0)
    pub async fn get_alerts(&self, severity: Option<AlertSeverity>, limit: usize) -> Vec<Alert> {
        let state = self.state.read().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|alert| severity.map_or(true, |wanted| alert.severity == wanted))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if limit > 0 {
            alerts.truncate(limit);
        }
        alerts
    }

    pub async fn clear_alerts(&self) {
        self.state.write().await.alerts.clear();
        info!("All alerts cleared");
    }
}

fn in_window(alert: &Alert, now: DateTime<Utc>, config: &MonitoringConfig) -> bool {
    (now - alert.timestamp)
        .to_std()
        .map(|age| age < config.alert_retention())
        .unwrap_or(true)
}

fn recent_alerts<'a>(
    alerts: impl Iterator<Item = &'a Alert>,
    now: DateTime<Utc>,
    config: &MonitoringConfig,
) -> Vec<Alert> {
    alerts
        .filter(|alert| in_window(alert, now, config))
        .cloned()
        .collect()
}

/// `100 - errors * critical_penalty - warnings * warning_penalty`, clamped at zero
fn score_alerts<'a>(
    alerts: impl Iterator<Item = &'a Alert>,
    now: DateTime<Utc>,
    config: &MonitoringConfig,
) -> (f64, HealthState) {
    let mut critical = 0u32;
    let mut warnings = 0u32;
    for alert in alerts.filter(|alert| in_window(alert, now, config)) {
        match alert.severity {
            AlertSeverity::Error => critical += 1,
            AlertSeverity::Warning => warnings += 1,
            AlertSeverity::Info => {}
        }
    }

    let score = (100.0
        - f64::from(critical) * config.critical_alert_penalty
        - f64::from(warnings) * config.warning_alert_penalty)
        .max(0.0);

    let status = if score < config.critical_threshold {
        HealthState::Critical
    } else if score < config.warning_threshold {
        HealthState::Warning
    } else {
        HealthState::Healthy
    };
    (score, status)
}
