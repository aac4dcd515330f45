// MaaS module - writes check results in the monitoring agent's line protocol
//
// The agent runs a plugin and reads its stdout line by line:
//
//   status okay <optional message>
//   metric memcache_api_local_status uint32 1
//   metric nova_api_local_response_time uint32 12.345 ms
//
// A run reports exactly one status line followed by at most 50 metric lines.

use std::fmt;
use std::io::Write;
use thiserror::Error;
use tracing::{debug, error};

/// Upper bound on metric lines the agent accepts from one run
pub const MAX_METRICS: usize = 50;

/// Errors that can occur while emitting results
#[derive(Error, Debug)]
pub enum EmitError {
    #[error("Failed to write to output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Maximum of {} metrics per check", MAX_METRICS)]
    TooManyMetrics,

    #[error("Invalid metric name: '{0}'")]
    InvalidName(String),
}

/// Overall outcome reported on the status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Okay,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Okay => write!(f, "okay"),
            Status::Error => write!(f, "error"),
        }
    }
}

/// Value types understood by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Uint32,
    Uint64,
    Double,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricType::Uint32 => "uint32",
            MetricType::Uint64 => "uint64",
            MetricType::Double => "double",
        };
        f.write_str(name)
    }
}

/// One metric line
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub kind: MetricType,
    pub value: String,
    pub unit: Option<String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, kind: MetricType, value: impl ToString) -> Self {
        Metric {
            name: name.into(),
            kind,
            value: value.to_string(),
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// A boolean reported as `uint32` 1 or 0
    pub fn boolean(name: impl Into<String>, flag: bool) -> Self {
        Metric::new(name, MetricType::Uint32, u32::from(flag))
    }
}

/// Writer for the agent protocol
///
/// Holds the output sink and the number of metrics already written.
/// Production code wraps stdout; tests wrap a `Vec<u8>`.
pub struct MetricEmitter<W: Write> {
    out: W,
    metrics_written: usize,
}

impl<W: Write> MetricEmitter<W> {
    pub fn new(out: W) -> Self {
        MetricEmitter {
            out,
            metrics_written: 0,
        }
    }

    /// Writes a `status` line
    pub fn status(&mut self, status: Status, message: Option<&str>) -> Result<(), EmitError> {
        let line = match message {
            Some(message) if !message.is_empty() => format!("status {} {}", status, message),
            _ => format!("status {}", status),
        };
        self.write_line(&line)
    }

    pub fn status_ok(&mut self, message: Option<&str>) -> Result<(), EmitError> {
        self.status(Status::Okay, message)
    }

    pub fn status_err(&mut self, message: &str) -> Result<(), EmitError> {
        error!("Check failed: {}", message);
        self.status(Status::Error, Some(message))
    }

    /// Checks that a batch of metrics can be written without hitting an error
    ///
    /// Lets a caller decide between `status okay` and `status error` before
    /// anything reaches the sink.
    pub fn validate(&self, metrics: &[Metric]) -> Result<(), EmitError> {
        if let Some(bad) = metrics.iter().find(|m| !valid_name(&m.name)) {
            return Err(EmitError::InvalidName(bad.name.clone()));
        }
        if self.metrics_written + metrics.len() > MAX_METRICS {
            return Err(EmitError::TooManyMetrics);
        }
        Ok(())
    }

    /// Writes a `metric` line, enforcing the per-run limit
    pub fn metric(&mut self, metric: &Metric) -> Result<(), EmitError> {
        if !valid_name(&metric.name) {
            return Err(EmitError::InvalidName(metric.name.clone()));
        }
        if self.metrics_written >= MAX_METRICS {
            return Err(EmitError::TooManyMetrics);
        }

        let mut line = format!("metric {} {} {}", metric.name, metric.kind, metric.value);
        if let Some(unit) = &metric.unit {
            line.push(' ');
            line.push_str(unit);
        }
        self.write_line(&line)?;
        self.metrics_written += 1;
        Ok(())
    }

    pub fn metric_bool(&mut self, name: &str, flag: bool) -> Result<(), EmitError> {
        self.metric(&Metric::boolean(name, flag))
    }

    /// Number of metric lines written so far
    pub fn metrics_written(&self) -> usize {
        self.metrics_written
    }

    /// Returns the underlying sink
    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &str) -> Result<(), EmitError> {
        let line = line.replace('\n', "\\n");
        debug!("Emitting: {}", line);
        writeln!(self.out, "{}", line)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Metric names are a single non-empty word
fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(emitter: MetricEmitter<Vec<u8>>) -> String {
        String::from_utf8(emitter.into_inner()).unwrap()
    }

    #[test]
    fn test_status_lines() {
        let mut emitter = MetricEmitter::new(Vec::new());
        emitter.status_ok(None).unwrap();
        emitter.status_err("memcached is down").unwrap();
        assert_eq!(output(emitter), "status okay\nstatus error memcached is down\n");
    }

    #[test]
    fn test_metric_lines() {
        let mut emitter = MetricEmitter::new(Vec::new());
        emitter
            .metric(&Metric::new("nova_api_local_response_time", MetricType::Uint32, "12.345").with_unit("ms"))
            .unwrap();
        emitter.metric_bool("memcache_api_local_status", true).unwrap();
        emitter.metric_bool("nova_api_local_status", false).unwrap();
        assert_eq!(
            output(emitter),
            "metric nova_api_local_response_time uint32 12.345 ms\n\
             metric memcache_api_local_status uint32 1\n\
             metric nova_api_local_status uint32 0\n"
        );
    }

    #[test]
    fn test_newlines_are_escaped() {
        let mut emitter = MetricEmitter::new(Vec::new());
        emitter.status_err("first\nsecond").unwrap();
        assert_eq!(output(emitter), "status error first\\nsecond\n");
    }

    #[test]
    fn test_metric_limit() {
        let mut emitter = MetricEmitter::new(Vec::new());
        for i in 0..MAX_METRICS {
            emitter
                .metric(&Metric::new(format!("m{}", i), MetricType::Uint64, i))
                .unwrap();
        }
        assert!(matches!(
            emitter.metric(&Metric::new("one_too_many", MetricType::Uint64, 0)),
            Err(EmitError::TooManyMetrics)
        ));
        assert_eq!(emitter.metrics_written(), MAX_METRICS);
    }

    #[test]
    fn test_metric_name_must_be_one_word() {
        let mut emitter = MetricEmitter::new(Vec::new());
        assert!(matches!(
            emitter.metric(&Metric::new("two words", MetricType::Uint32, 1)),
            Err(EmitError::InvalidName(_))
        ));
    }

    #[test]
    fn test_validate_checks_names_and_limit() {
        let emitter = MetricEmitter::new(Vec::new());
        let good: Vec<Metric> = (0..MAX_METRICS)
            .map(|i| Metric::new(format!("m{}", i), MetricType::Uint64, i))
            .collect();
        assert!(emitter.validate(&good).is_ok());

        let mut too_many = good.clone();
        too_many.push(Metric::new("extra", MetricType::Uint64, 0));
        assert!(matches!(emitter.validate(&too_many), Err(EmitError::TooManyMetrics)));

        let named = [Metric::boolean("ok", true), Metric::boolean("bad name", true)];
        assert!(matches!(
            emitter.validate(&named),
            Err(EmitError::InvalidName(name)) if name == "bad name"
        ));
        assert_eq!(output(emitter), "");
    }
}
