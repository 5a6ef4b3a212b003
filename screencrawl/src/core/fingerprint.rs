//! Structural fingerprints and label extraction for page-source snapshots.
//!
//! Two captures are the same screen when their normalized page sources hash to
//! the same value. Normalization drops geometry attributes and collapses
//! whitespace so that scroll offsets and animation frames do not produce new
//! fingerprints for an unchanged view hierarchy.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

static GEOMETRY_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s+(?:x|y|width|height|index)=(?:"[^"]*"|'[^']*')"#).expect("geometry regex")
});
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("ws regex"));

/// Hex-encoded SHA-256 of a normalized page source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a raw page-source snapshot.
    pub fn of(page_source: &str) -> Self {
        let normalized = normalize(page_source);
        let digest = Sha256::digest(normalized.as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for logs and file names.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize(page_source: &str) -> String {
    let stripped = GEOMETRY_ATTR.replace_all(page_source, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

/// Extract visible element labels (`name`/`label` attributes) in document order.
///
/// Duplicates are dropped, keeping the first occurrence. A malformed or
/// truncated snapshot yields the labels read before the parse error.
pub fn extract_labels(page_source: &str) -> Vec<String> {
    let mut reader = Reader::from_str(page_source);
    let mut seen = HashSet::new();
    let mut labels = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let mut attrs = e.attributes();
                attrs.with_checks(false);
                for attr in attrs.flatten() {
                    if !matches!(attr.key.as_ref(), b"name" | b"label") {
                        continue;
                    }
                    let Ok(value) = attr.unescape_value() else {
                        continue;
                    };
                    let label = value.trim();
                    if !label.is_empty() && seen.insert(label.to_string()) {
                        labels.push(label.to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                debug!(
                    error = %err,
                    position = reader.buffer_position(),
                    "page source parse stopped"
                );
                break;
            }
            _ => {}
        }
    }
    labels
}
