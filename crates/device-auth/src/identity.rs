//! Device identity collection.
//!
//! The device supplies an executable which prints `key=value` lines on
//! standard output. Keys may repeat; every value is kept in emission order.

use std::path::Path;
use std::process::Stdio;

use serde::ser::{Serialize, SerializeMap, Serializer};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{AuthError, Result};

/// Ordered multi-valued mapping of identity attribute names to values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityAttributes {
    entries: Vec<(String, Vec<String>)>,
}

impl IdentityAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value. A key seen before keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, values)| values.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(k, values)| (k.as_str(), values.as_slice()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse helper output. Lines without `=` or with an empty key are skipped.
    pub fn parse(output: &str) -> Self {
        let mut attributes = Self::new();
        for (lineno, raw) in output.lines().enumerate() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) if !key.is_empty() => attributes.insert(key, value),
                _ => warn!("Skipping malformed identity line {}: {:?}", lineno + 1, line),
            }
        }
        attributes
    }

    /// The canonical `id_data` encoding: a JSON object in first-emission key
    /// order, single values as strings and repeated keys as arrays.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Serialize for IdentityAttributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, values) in self.iter() {
            match values {
                [single] => map.serialize_entry(key, single)?,
                many => map.serialize_entry(key, many)?,
            }
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for IdentityAttributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Self::new();
        for (key, value) in iter {
            attributes.insert(key, value);
        }
        attributes
    }
}

/// Run the identity helper to completion and parse its output.
pub async fn collect_identity(script: &Path) -> Result<IdentityAttributes> {
    info!("Running identity helper: {}", script.display());

    let output = Command::new(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| AuthError::IdentityCollectionFailed {
            status: None,
            stderr: format!("failed to spawn {}: {}", script.display(), e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(
            "Identity helper {} exited with {}: {}",
            script.display(),
            output.status,
            stderr
        );
        return Err(AuthError::IdentityCollectionFailed {
            status: output.status.code(),
            stderr,
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let attributes = IdentityAttributes::parse(&stdout);
    debug!("Collected {} identity attributes", attributes.len());
    Ok(attributes)
}
