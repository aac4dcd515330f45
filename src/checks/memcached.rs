// Memcached status check
//
// Queries a memcached instance with the text protocol `stats` command and
// reports whether it is up plus a few item and connection counters.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Check, CheckError, CheckReport};
use crate::maas::{Metric, MetricType};

pub const DEFAULT_PORT: u16 = 11211;

/// Versions this check has been validated against
pub const TESTED_VERSIONS: &[&str] = &["1.4.13", "1.4.14 (Ubuntu)"];

/// Stats reported as `memcache_<name>` when the server is up
const ITEM_STATS: [&str; 4] = ["total_items", "get_hits", "get_misses", "total_connections"];

const STATUS_METRIC: &str = "memcache_api_local_status";

/// Memcached status check
///
/// # Outcomes
/// - Unreachable or silent server: `status okay` with the status metric at 0
/// - Untested server version: `status error`
/// - Otherwise: status metric at 1 plus one `uint64` metric per item stat
pub struct MemcachedCheck {
    addr: SocketAddr,
    timeout: Duration,
}

impl MemcachedCheck {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        MemcachedCheck {
            addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
            timeout: Duration::from_secs(5),
        }
    }

    /// Overrides the connect and read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends `stats` and collects every `STAT` line up to `END`
    async fn fetch_stats(&self) -> io::Result<HashMap<String, String>> {
        let stream = timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        timeout(self.timeout, read_stats(stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "stats timed out"))?
    }
}

async fn read_stats(mut stream: TcpStream) -> io::Result<HashMap<String, String>> {
    stream.write_all(b"stats\r\n").await?;

    let mut reader = BufReader::new(stream);
    let mut stats = HashMap::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before END",
            ));
        }

        let trimmed = line.trim_end();
        if trimmed == "END" {
            break;
        }
        match parse_stat_line(trimmed) {
            Some((name, value)) => {
                stats.insert(name.to_string(), value.to_string());
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected response line: {}", trimmed),
                ))
            }
        }
    }

    Ok(stats)
}

/// Splits `STAT <name> <value>`; the value keeps any embedded spaces
fn parse_stat_line(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("STAT"), Some(name), Some(value)) if !name.is_empty() => Some((name, value)),
        _ => None,
    }
}

fn down_report() -> CheckReport {
    CheckReport::new().with_metric(Metric::boolean(STATUS_METRIC, false))
}

#[async_trait]
impl Check for MemcachedCheck {
    fn name(&self) -> &str {
        "memcached_status"
    }

    async fn run(&self) -> Result<CheckReport, CheckError> {
        let stats = match self.fetch_stats().await {
            Ok(stats) if !stats.is_empty() => stats,
            Ok(_) => {
                warn!("memcached at {} returned no stats", self.addr);
                return Ok(down_report());
            }
            Err(e) => {
                warn!("memcached at {} is unreachable: {}", self.addr, e);
                return Ok(down_report());
            }
        };
        debug!("memcached at {} returned {} stats", self.addr, stats.len());

        let version = stats
            .get("version")
            .ok_or_else(|| CheckError::MissingStat("version".to_string()))?;
        if !TESTED_VERSIONS.contains(&version.as_str()) {
            let tested = TESTED_VERSIONS
                .iter()
                .map(|v| format!("'{}'", v))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(CheckError::Failed(format!(
                "This plugin has only been tested with versions {} of memcached, and you are using version '{}'",
                tested, version
            )));
        }

        let mut report = CheckReport::new().with_metric(Metric::boolean(STATUS_METRIC, true));
        for name in ITEM_STATS {
            let raw = stats
                .get(name)
                .ok_or_else(|| CheckError::MissingStat(name.to_string()))?;
            let value: u64 = raw.parse().map_err(|_| CheckError::InvalidStat {
                name: name.to_string(),
                value: raw.clone(),
            })?;
            report.push(Metric::new(format!("memcache_{}", name), MetricType::Uint64, value));
        }

        Ok(report)
    }
}
