// Checks module - defines the checks run by the monitoring agent
//
// Every check implements `Check`. A check returns either a report (status
// okay plus metrics) or a `CheckError`, which the agent sees as
// `status error <message>` with no metrics. A report whose metrics the agent
// would reject is turned into `status error` before anything is written.

use async_trait::async_trait;
use std::io::Write;
use thiserror::Error;
use tracing::info;

use crate::maas::{EmitError, Metric, MetricEmitter};

pub mod command_timer;
pub mod memcached;
pub mod nova;

/// Failures that turn a check run into `status error`
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("{0}")]
    Failed(String),

    #[error("Required stat '{0}' missing from service response")]
    MissingStat(String),

    #[error("Stat '{name}' has a non-numeric value '{value}'")]
    InvalidStat { name: String, value: String },

    #[error("Invalid command '{0}': expected NAME=COMMAND")]
    InvalidCommand(String),

    #[error("Command '{name}' failed: {reason}")]
    CommandFailed { name: String, reason: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No '{0}' endpoint in the service catalog")]
    MissingEndpoint(String),
}

/// Successful outcome of a check run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckReport {
    /// Metric lines, in emission order
    pub metrics: Vec<Metric>,
}

impl CheckReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.push(metric);
        self
    }
}

/// Core trait that every check implements.
///
/// # Design
/// - **Async**: checks talk to the network or spawn processes on the Tokio runtime
/// - **Single shot**: `run` is called once per plugin invocation
#[async_trait]
pub trait Check: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Runs the check once
    async fn run(&self) -> Result<CheckReport, CheckError>;
}

/// Runs a check and writes its outcome in the agent protocol
///
/// # Returns
/// * `Ok(true)` - `status okay` and all metrics were written
/// * `Ok(false)` - The check failed, or its metrics were invalid, and
///   `status error` was written
/// * `Err(EmitError)` - Output could not be written
pub async fn run_check<W: Write>(
    check: &dyn Check,
    emitter: &mut MetricEmitter<W>,
) -> Result<bool, EmitError> {
    info!("Running check '{}'", check.name());

    match check.run().await {
        Ok(report) => {
            if let Err(e) = emitter.validate(&report.metrics) {
                emitter.status_err(&e.to_string())?;
                return Ok(false);
            }
            emitter.status_ok(None)?;
            for metric in &report.metrics {
                emitter.metric(metric)?;
            }
            info!(
                "Check '{}' reported {} metric(s)",
                check.name(),
                report.metrics.len()
            );
            Ok(true)
        }
        Err(e) => {
            emitter.status_err(&e.to_string())?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maas::MetricType;

    struct FixedCheck(Result<CheckReport, String>);

    #[async_trait]
    impl Check for FixedCheck {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn run(&self) -> Result<CheckReport, CheckError> {
            self.0.clone().map_err(CheckError::Failed)
        }
    }

    #[tokio::test]
    async fn test_run_check_reports_metrics() {
        let report = CheckReport::new()
            .with_metric(Metric::boolean("service_status", true))
            .with_metric(Metric::new("service_items", MetricType::Uint64, 42));
        let mut emitter = MetricEmitter::new(Vec::new());

        let ok = run_check(&FixedCheck(Ok(report)), &mut emitter).await.unwrap();

        assert!(ok);
        assert_eq!(
            String::from_utf8(emitter.into_inner()).unwrap(),
            "status okay\nmetric service_status uint32 1\nmetric service_items uint64 42\n"
        );
    }

    #[tokio::test]
    async fn test_run_check_rejects_invalid_metric_before_status() {
        let report = CheckReport::new()
            .with_metric(Metric::boolean("service_status", true))
            .with_metric(Metric::boolean("bad name", true));
        let mut emitter = MetricEmitter::new(Vec::new());

        let ok = run_check(&FixedCheck(Ok(report)), &mut emitter).await.unwrap();

        assert!(!ok);
        assert_eq!(
            String::from_utf8(emitter.into_inner()).unwrap(),
            "status error Invalid metric name: 'bad name'\n"
        );
    }

    #[tokio::test]
    async fn test_run_check_rejects_too_many_metrics() {
        let mut report = CheckReport::new();
        for i in 0..=crate::maas::MAX_METRICS {
            report.push(Metric::new(format!("m{}", i), MetricType::Uint64, i));
        }
        let mut emitter = MetricEmitter::new(Vec::new());

        let ok = run_check(&FixedCheck(Ok(report)), &mut emitter).await.unwrap();

        assert!(!ok);
        assert_eq!(
            String::from_utf8(emitter.into_inner()).unwrap(),
            "status error Maximum of 50 metrics per check\n"
        );
    }

    #[tokio::test]
    async fn test_run_check_reports_failure_without_metrics() {
        let mut emitter = MetricEmitter::new(Vec::new());

        let ok = run_check(&FixedCheck(Err("boom".to_string())), &mut emitter)
            .await
            .unwrap();

        assert!(!ok);
        assert_eq!(
            String::from_utf8(emitter.into_inner()).unwrap(),
            "status error boom\n"
        );
    }
}
