//! Output redaction for execution results.
//!
//! Secret values injected into an execution must never leave the sandbox in
//! its stdout, error text or result. Error text additionally has file-system
//! paths stripped so host layout does not leak through tracebacks or
//! exception messages.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Placeholder substituted for every secret value.
pub const REDACTED: &str = "[REDACTED]";

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(home|Users|etc|var|tmp|opt|usr|root|mnt|srv|proc|sys|dev|run|boot|snap|nix|private|Library)(/[\w.\-]+)+").unwrap()
});

static WINDOWS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]:\\[\w.\\\-]+").unwrap());

/// Replaces known secret values with [`REDACTED`].
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Non-empty secret values, longest first so overlapping values are
    /// replaced whole.
    values: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values: Vec<String> = secrets
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace every secret occurrence in `text`.
    pub fn redact_str(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), REDACTED);
            }
        }
        out
    }

    /// Redact captured stdout.
    ///
    /// A truncated capture may end in the first bytes of a secret that the
    /// cut split in two; that tail is dropped before the complete occurrences
    /// are replaced.
    pub fn redact_output(&self, text: &str, truncated: bool) -> String {
        if !truncated {
            return self.redact_str(text);
        }
        let keep = text.len() - self.partial_secret_suffix(text);
        self.redact_str(&text[..keep])
    }

    /// Length of the longest suffix of `text` that is a proper prefix of a secret.
    fn partial_secret_suffix(&self, text: &str) -> usize {
        self.values
            .iter()
            .filter_map(|value| {
                (1..value.len().min(text.len() + 1))
                    .rev()
                    .filter(|&len| value.is_char_boundary(len))
                    .find(|&len| text.ends_with(&value[..len]))
            })
            .max()
            .unwrap_or(0)
    }

    /// Redact every string inside a JSON value, including object keys.
    ///
    /// Numbers and booleans are compared by their JSON text; one that
    /// contains a secret comes back as a redacted string.
    pub fn redact_value(&self, value: Value) -> Value {
        if self.values.is_empty() {
            return value;
        }
        match value {
            Value::String(s) => Value::String(self.redact_str(&s)),
            Value::Number(_) | Value::Bool(_) => {
                let text = value.to_string();
                let redacted = self.redact_str(&text);
                if redacted == text {
                    value
                } else {
                    Value::String(redacted)
                }
            }
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (self.redact_str(&k), self.redact_value(v)))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Prepare an error message for the caller: secrets first, then paths.
    pub fn sanitize_error(&self, message: &str) -> String {
        strip_paths(&self.redact_str(message))
    }
}

/// Replace Unix and Windows file-system paths with `[path]`.
pub fn strip_paths(message: &str) -> String {
    let msg = UNIX_PATH_RE.replace_all(message, "[path]");
    WINDOWS_PATH_RE.replace_all(&msg, "[path]").to_string()
}
