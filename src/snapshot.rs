// Snapshot module - turns a raw monitoring API dump into a template document
//
// The raw dump lists, per host, the monitoring entity and its checks with
// their alarms and metrics. A snapshot re-keys those lists by label or
// name, drops volatile identifiers and redacts host-specific values so the
// result can be compared against the templates of a branch.
//
// # Raw Input
// ```json
// [
//   {
//     "entity": { "id": "en123", "label": "infra1", "ip_addresses": { "public0_v4": "10.0.0.5" } },
//     "checks": [
//       {
//         "id": "ch1",
//         "label": "memcached_status",
//         "alarms": [ { "id": "al1", "label": "memcache_up", "criteria": "..." } ],
//         "metrics": [ [ { "name": "memcache_total_items", "type": "l" } ] ]
//       }
//     ]
//   }
// ]
// ```

use regex::Regex;
use serde_json::Value;
use std::convert::Infallible;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::diff::Document;
use crate::templates::to_pretty_json;

/// Keys that differ between deployments and are dropped from snapshots
const VOLATILE_KEYS: [&str; 10] = [
    "created_at",
    "updated_at",
    "latest_alarm_states",
    "check_id",
    "entity_id",
    "id",
    "agent_id",
    "label",
    "notification_plan_id",
    "uri",
];

/// Errors that can occur while building or writing a snapshot
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected raw data layout: {0}")]
    Shape(String),

    #[error("Invalid redaction pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Pairs an entity label in the raw dump with the template name it is saved under
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMapping {
    pub label: String,
    pub template: String,
}

impl FromStr for LabelMapping {
    type Err = Infallible;

    /// Parses `LABEL:TEMPLATE`; a bare `LABEL` maps to itself
    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let (label, template) = arg.split_once(':').unwrap_or((arg, arg));
        Ok(LabelMapping {
            label: label.to_string(),
            template: template.to_string(),
        })
    }
}

/// Where and how a snapshot is written
pub struct SnapshotRequest {
    pub playbook: String,
    pub branch: String,
    pub base_dir: PathBuf,
    pub raw_output: bool,
}

impl SnapshotRequest {
    fn directory(&self) -> PathBuf {
        self.base_dir.join(&self.branch)
    }

    /// Path of the snapshot file
    pub fn snapshot_path(&self) -> PathBuf {
        self.directory().join(format!("{}.maas_data", self.playbook))
    }

    /// Path of the raw dump copy written with `raw_output`
    pub fn raw_path(&self) -> PathBuf {
        self.directory().join(format!("{}.maas_data.raw", self.playbook))
    }
}

/// Compiled patterns applied to the whole snapshot text
struct Redactor {
    container: Regex,
    ip_address: Regex,
}

impl Redactor {
    fn new() -> Result<Self, regex::Error> {
        Ok(Redactor {
            container: Regex::new(r"container-[0-9a-f]{8}")?,
            ip_address: Regex::new(r"[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}")?,
        })
    }

    fn redact(&self, text: &str) -> String {
        let text = self.container.replace_all(text, "container-UID");
        self.ip_address.replace_all(&text, "IP_ADDRESS").into_owned()
    }
}

/// Builds the snapshot document from a raw dump
///
/// Hosts are paired with `labels` by position; each resulting entity is
/// stored under its mapping's template name.
pub fn build_snapshot(raw: &Value, labels: &[LabelMapping]) -> Result<Value, SnapshotError> {
    let hosts = raw
        .as_array()
        .ok_or_else(|| SnapshotError::Shape("raw data is not a list of hosts".to_string()))?;
    if hosts.len() != labels.len() {
        warn!(
            "Raw data has {} host(s) but {} label mapping(s) were given; extra entries are ignored",
            hosts.len(),
            labels.len()
        );
    }

    let mut entities = Document::new();
    for (host, mapping) in hosts.iter().zip(labels) {
        let mut entity = normalize_host(host.clone())?;
        let original_label = match entity.get("label") {
            Some(Value::String(label)) => label.clone(),
            _ => return Err(SnapshotError::Shape("entity has no string 'label'".to_string())),
        };
        strip_volatile_keys(&mut entity);

        let addresses = ip_addresses(&entity);
        let mut text = serde_json::to_string(&entity)?;
        if !original_label.is_empty() {
            text = text.replace(&original_label, &mapping.template);
        }
        for (name, ip) in &addresses {
            text = replace_standalone(&text, ip, &name.to_uppercase());
        }
        debug!(
            "Entity '{}' saved as '{}' with {} address(es) redacted",
            original_label,
            mapping.template,
            addresses.len()
        );

        entities.insert(mapping.template.clone(), serde_json::from_str(&text)?);
    }

    let text = Redactor::new()?.redact(&serde_json::to_string(&entities)?);
    Ok(serde_json::from_str(&text)?)
}

/// Builds a snapshot and writes it under `<base_dir>/<branch>/`
///
/// # Returns
/// Path of the written snapshot file
pub fn write_snapshot(
    request: &SnapshotRequest,
    raw: &Value,
    labels: &[LabelMapping],
) -> Result<PathBuf, SnapshotError> {
    let directory = request.directory();
    fs::create_dir_all(&directory).map_err(|source| SnapshotError::Io {
        path: directory.clone(),
        source,
    })?;

    if request.raw_output {
        write_file(&request.raw_path(), &to_pretty_json(raw)?)?;
    }

    let snapshot = build_snapshot(raw, labels)?;
    let path = request.snapshot_path();
    write_file(&path, &to_pretty_json(&snapshot)?)?;
    info!("Wrote snapshot to {}", path.display());
    Ok(path)
}

fn write_file(path: &Path, contents: &str) -> Result<(), SnapshotError> {
    fs::write(path, contents).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Re-keys checks by label, alarms by label and metrics by name, then
/// attaches the checks to the entity
fn normalize_host(host: Value) -> Result<Document, SnapshotError> {
    let Value::Object(mut host) = host else {
        return Err(shape("host is not an object"));
    };
    let Some(Value::Object(mut entity)) = host.remove("entity") else {
        return Err(shape("host has no 'entity' object"));
    };

    let mut checks = Document::new();
    for check in take_list(&mut host, "checks")? {
        let Value::Object(mut check) = check else {
            return Err(shape("check is not an object"));
        };

        let alarms = take_list(&mut check, "alarms")?;
        check.insert("alarms".to_string(), Value::Object(things_by("label", alarms)?));

        // only the first metric list belongs to the check
        let metrics = match take_list(&mut check, "metrics")?.into_iter().next() {
            Some(Value::Array(metrics)) => metrics,
            Some(_) => return Err(shape("check metrics are not a list of lists")),
            None => Vec::new(),
        };
        check.insert("metrics".to_string(), Value::Object(things_by("name", metrics)?));

        let label = key_of(&check, "label")?;
        checks.insert(label, Value::Object(check));
    }

    entity.insert("checks".to_string(), Value::Object(checks));
    Ok(entity)
}

/// Removes volatile keys from the entity, its checks map, each check, each
/// alarms map and each alarm
fn strip_volatile_keys(entity: &mut Document) {
    remove_volatile(entity);
    let Some(Value::Object(checks)) = entity.get_mut("checks") else {
        return;
    };
    remove_volatile(checks);

    for check in checks.values_mut() {
        let Value::Object(check) = check else { continue };
        remove_volatile(check);
        let Some(Value::Object(alarms)) = check.get_mut("alarms") else {
            continue;
        };
        remove_volatile(alarms);
        for alarm in alarms.values_mut() {
            if let Value::Object(alarm) = alarm {
                remove_volatile(alarm);
            }
        }
    }
}

fn remove_volatile(map: &mut Document) {
    for key in VOLATILE_KEYS {
        map.remove(key);
    }
}

/// `(label, address)` pairs from the entity's `ip_addresses`
fn ip_addresses(entity: &Document) -> Vec<(String, String)> {
    match entity.get("ip_addresses") {
        Some(Value::Object(addresses)) => addresses
            .iter()
            .filter_map(|(name, ip)| ip.as_str().map(|ip| (name.clone(), ip.to_string())))
            .filter(|(_, ip)| !ip.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Replaces every occurrence of `needle` that is not part of a longer number
///
/// A rejected match only skips one character, so a valid occurrence that
/// overlaps it is still found.
fn replace_standalone(text: &str, needle: &str, replacement: &str) -> String {
    if needle.is_empty() {
        return text.to_string();
    }

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut pos = 0;

    while let Some(found) = text[pos..].find(needle) {
        let start = pos + found;
        let end = start + needle.len();
        let digit_before = start > 0 && bytes[start - 1].is_ascii_digit();
        let digit_after = end < bytes.len() && bytes[end].is_ascii_digit();

        if digit_before || digit_after {
            pos = start + text[start..].chars().next().map_or(1, char::len_utf8);
            continue;
        }
        out.push_str(&text[last..start]);
        out.push_str(replacement);
        last = end;
        pos = end;
    }

    out.push_str(&text[last..]);
    out
}

fn things_by(field: &str, things: Vec<Value>) -> Result<Document, SnapshotError> {
    let mut by_key = Document::new();
    for thing in things {
        let Value::Object(thing) = thing else {
            return Err(shape(&format!("entry keyed by '{}' is not an object", field)));
        };
        by_key.insert(key_of(&thing, field)?, Value::Object(thing));
    }
    Ok(by_key)
}

fn key_of(thing: &Document, field: &str) -> Result<String, SnapshotError> {
    match thing.get(field) {
        Some(Value::String(key)) => Ok(key.clone()),
        Some(Value::Number(key)) => Ok(key.to_string()),
        _ => Err(shape(&format!("entry has no '{}'", field))),
    }
}

fn take_list(map: &mut Document, field: &str) -> Result<Vec<Value>, SnapshotError> {
    match map.remove(field) {
        Some(Value::Array(list)) => Ok(list),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err(shape(&format!("'{}' is not a list", field))),
    }
}

fn shape(reason: &str) -> SnapshotError {
    SnapshotError::Shape(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn raw_dump() -> Value {
        json!([
            {
                "entity": {
                    "id": "en123",
                    "label": "infra1_host",
                    "uri": "https://monitoring.example/entities/en123",
                    "agent_id": "infra1_host",
                    "ip_addresses": {"public0_v4": "10.0.0.5", "private0_v4": "172.29.236.10"},
                    "metadata": {"note": "infra1_host at 10.0.0.55"}
                },
                "checks": [
                    {
                        "id": "ch1",
                        "entity_id": "en123",
                        "label": "memcached_status--infra1_memcached_container-1a2b3c4d",
                        "created_at": 1,
                        "details": {"args": ["172.29.236.10"], "file": "memcached_status.py"},
                        "alarms": [
                            {"id": "al1", "check_id": "ch1", "label": "memcache_up", "criteria": ":set consecutiveCount=3"}
                        ],
                        "metrics": [[
                            {"name": "memcache_total_items", "type": "l"},
                            {"name": "memcache_api_local_status", "type": "I"}
                        ]]
                    }
                ]
            }
        ])
    }

    #[test]
    fn test_label_mapping_parse() {
        assert_eq!(
            "infra1_host:infra1".parse::<LabelMapping>().unwrap(),
            LabelMapping { label: "infra1_host".into(), template: "infra1".into() }
        );
        assert_eq!(
            "infra1_host".parse::<LabelMapping>().unwrap(),
            LabelMapping { label: "infra1_host".into(), template: "infra1_host".into() }
        );
    }

    #[test]
    fn test_build_snapshot_normalizes_and_redacts() {
        let labels: Vec<LabelMapping> = vec!["infra1_host:infra1".parse().unwrap()];

        let snapshot = build_snapshot(&raw_dump(), &labels).unwrap();

        assert_eq!(
            snapshot,
            json!({
                "infra1": {
                    "ip_addresses": {"public0_v4": "PUBLIC0_V4", "private0_v4": "PRIVATE0_V4"},
                    "metadata": {"note": "infra1 at IP_ADDRESS"},
                    "checks": {
                        "memcached_status--infra1_memcached_container-UID": {
                            "details": {"args": ["PRIVATE0_V4"], "file": "memcached_status.py"},
                            "alarms": {
                                "memcache_up": {"criteria": ":set consecutiveCount=3"}
                            },
                            "metrics": {
                                "memcache_total_items": {"name": "memcache_total_items", "type": "l"},
                                "memcache_api_local_status": {"name": "memcache_api_local_status", "type": "I"}
                            }
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn test_replace_standalone_respects_digit_boundaries() {
        assert_eq!(
            replace_standalone("10.0.0.5 10.0.0.55 110.0.0.5 x10.0.0.5y", "10.0.0.5", "PUB"),
            "PUB 10.0.0.55 110.0.0.5 xPUBy"
        );
    }

    #[test]
    fn test_replace_standalone_finds_overlapping_occurrence() {
        assert_eq!(replace_standalone("21.1.1", "1.1", "X"), "21.X");
        assert_eq!(
            replace_standalone("210.0.0.10.0.0.1", "10.0.0.1", "PUB"),
            "210.0.0.PUB"
        );
    }

    #[test]
    fn test_rejects_non_list_input() {
        assert!(matches!(
            build_snapshot(&json!({"entity": {}}), &[]),
            Err(SnapshotError::Shape(_))
        ));
    }

    #[test]
    fn test_write_snapshot_creates_branch_directory() {
        let dir = TempDir::new().unwrap();
        let request = SnapshotRequest {
            playbook: "setup-memcached".to_string(),
            branch: "master".to_string(),
            base_dir: dir.path().to_path_buf(),
            raw_output: true,
        };
        let labels: Vec<LabelMapping> = vec!["infra1_host:infra1".parse().unwrap()];

        let path = write_snapshot(&request, &raw_dump(), &labels).unwrap();

        assert_eq!(path, dir.path().join("master").join("setup-memcached.maas_data"));
        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written.get("infra1").is_some());
        assert!(request.raw_path().exists());
    }
}
