// Templates module - loads monitoring templates from a branch checkout
//
// This module is responsible for:
// 1. Locating a named template under `<templates_dir>/<branch>/<name>`
// 2. Parsing it as a JSON document
// 3. Combining several playbook templates into one reference document
//
// # Template Layout
// ```json
// {
//   "infra1_memcached_container-UID": {
//     "checks": {
//       "memcached_status": { "type": "agent.plugin", "period": 60 }
//     },
//     "ip_addresses": { "public0_v4": "IP_ADDRESS" }
//   }
// }
// ```

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Serializer, Value};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

use crate::diff::Document;

/// Errors that can occur while loading templates
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read template {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Template {} is not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Template {} does not contain a JSON object", .0.display())]
    NotAnObject(PathBuf),

    #[error("Entity '{label}' cannot be merged: {reason}")]
    InvalidEntity { label: String, reason: String },
}

/// Read-only access to a directory of per-branch template checkouts
pub struct TemplateStore {
    templates_dir: PathBuf,
}

impl TemplateStore {
    /// Creates a store rooted at `templates_dir`
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        TemplateStore {
            templates_dir: templates_dir.into(),
        }
    }

    /// Path of a template within a branch
    pub fn template_path(&self, branch: &str, name: &str) -> PathBuf {
        self.templates_dir.join(branch).join(name)
    }

    /// Loads one template and checks that it is a document
    ///
    /// # Returns
    /// * `Ok(Document)` - The parsed top-level object
    /// * `Err(TemplateError)` - Unreadable file, invalid JSON, or a non-object root
    pub fn load(&self, branch: &str, name: &str) -> Result<Document, TemplateError> {
        let path = self.template_path(branch, name);
        debug!("Loading template {}", path.display());

        let text = fs::read_to_string(&path).map_err(|source| TemplateError::Io {
            path: path.clone(),
            source,
        })?;

        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(document)) => Ok(document),
            Ok(_) => Err(TemplateError::NotAnObject(path)),
            Err(source) => Err(TemplateError::Parse { path, source }),
        }
    }

    /// Builds a reference document out of several playbook templates
    ///
    /// A trailing `.yml` is stripped from each playbook name to get the
    /// template name. The first template that defines an entity label
    /// contributes the whole entity; later templates defining the same label
    /// only contribute their `checks`, which are unioned into the existing
    /// entity with the later definition winning per check.
    ///
    /// # Arguments
    /// * `playbooks` - Playbook names in merge order
    /// * `branch` - Branch directory to read from
    pub fn load_playbooks<S: AsRef<str>>(
        &self,
        playbooks: &[S],
        branch: &str,
    ) -> Result<Document, TemplateError> {
        let mut entities = Document::new();

        for playbook in playbooks {
            let playbook = playbook.as_ref();
            let template = playbook.strip_suffix(".yml").unwrap_or(playbook);
            let data = self.load(branch, template)?;
            info!(
                "Loaded template '{}' with {} entit(ies) from branch '{}'",
                template,
                data.len(),
                branch
            );

            for (label, entity) in data {
                match entities.get_mut(&label) {
                    Some(existing) => merge_checks(&label, existing, entity)?,
                    None => {
                        entities.insert(label, entity);
                    }
                }
            }
        }

        Ok(entities)
    }
}

/// Unions `incoming.checks` into `existing.checks`
fn merge_checks(label: &str, existing: &mut Value, incoming: Value) -> Result<(), TemplateError> {
    let invalid = |reason: &str| TemplateError::InvalidEntity {
        label: label.to_string(),
        reason: reason.to_string(),
    };

    let Value::Object(mut incoming) = incoming else {
        return Err(invalid("entity is not an object"));
    };
    let Some(Value::Object(incoming_checks)) = incoming.remove("checks") else {
        return Err(invalid("entity has no 'checks' object"));
    };
    let Some(Value::Object(existing_checks)) = existing.get_mut("checks") else {
        return Err(invalid("entity has no 'checks' object"));
    };

    debug!(
        "Merging {} check(s) into entity '{}'",
        incoming_checks.len(),
        label
    );
    existing_checks.extend(incoming_checks);
    Ok(())
}

/// Renders a value as 4-space indented JSON with sorted keys
///
/// The value goes through `serde_json::Value` first so struct fields are
/// ordered by key like everything else (`serde_json::Map` is key-ordered).
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(value)?;
    let mut buf = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
