//! Input sanitization for inbound messages.
//!
//! Pure functions, no side effects. [`sanitize_message`] validates and
//! normalizes a decoded [`Message`] and fails fast with an error naming the
//! first violated rule. Role and part-kind whitelisting happen at the serde
//! layer (closed enums); everything else is enforced here.
//!
//! Sanitization is idempotent: running a successfully sanitized message
//! through again yields the same message.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::A2aError;
use crate::protocol::{FileContent, Message, Part};

/// Caps applied by the sanitizer. Defaults mirror the server configuration.
#[derive(Debug, Clone)]
pub struct SanitizeLimits {
    /// Max parts per message.
    pub max_parts: usize,
    /// Max bytes per text part.
    pub max_text_len: usize,
    /// Max serialized bytes for the whole message.
    pub max_message_len: usize,
}

impl Default for SanitizeLimits {
    fn default() -> Self {
        Self {
            max_parts: 100,
            max_text_len: 512 * 1024,
            max_message_len: 1024 * 1024,
        }
    }
}

const MAX_ID_LEN: usize = 256;
const MAX_FILENAME_LEN: usize = 255;

static MIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_.+]*/[A-Za-z0-9][A-Za-z0-9\-_.+]*$")
        .expect("mime regex compiles")
});

static SCHEME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9+.\-]*):").expect("scheme regex compiles"));

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "file"];
/// Rejected outright even though the allowlist would already exclude them —
/// these are the classic script-injection vectors and get a named error.
const FORBIDDEN_SCHEMES: &[&str] = &["javascript", "data", "vbscript"];

fn validation(msg: impl Into<String>) -> A2aError {
    A2aError::Validation(msg.into())
}

// ─── String scrubbing ─────────────────────────────────────────────────────────

/// Strip null bytes and ASCII control characters, keeping `\t`, `\n`, `\r`.
///
/// Removed: 0x00–0x08, 0x0B, 0x0C, 0x0E–0x1F, 0x7F.
pub fn scrub_control_chars(s: &str) -> String {
    s.chars()
        .filter(|&c| {
            !matches!(c, '\u{00}'..='\u{08}' | '\u{0B}' | '\u{0C}' | '\u{0E}'..='\u{1F}' | '\u{7F}')
        })
        .collect()
}

/// Normalize a client-supplied filename.
///
/// Path separators (`/ \ : \0`) are stripped, runs of leading dots collapse
/// to one, the result is truncated to 255 chars, and an empty or dot-only
/// result is replaced with `unnamed_file`.
pub fn sanitize_filename(name: &str) -> String {
    let scrubbed = scrub_control_chars(name);
    let stripped: String = scrubbed
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':'))
        .collect();

    let trimmed = stripped.trim_start_matches('.');
    let collapsed = if trimmed.len() < stripped.len() {
        format!(".{trimmed}")
    } else {
        stripped
    };

    let truncated: String = collapsed.chars().take(MAX_FILENAME_LEN).collect();
    if truncated.is_empty() || truncated == "." {
        return "unnamed_file".to_string();
    }
    truncated
}

/// Validate and lowercase a MIME type.
pub fn sanitize_mime_type(mime: &str) -> Result<String, A2aError> {
    let lowered = mime.to_ascii_lowercase();
    if !MIME_RE.is_match(&lowered) {
        return Err(validation(format!("invalid MIME type: {mime}")));
    }
    Ok(lowered)
}

/// Validate a URI: scheme must parse and be one of http, https, file.
pub fn sanitize_uri(uri: &str) -> Result<String, A2aError> {
    let scrubbed = scrub_control_chars(uri.trim());
    let scheme = SCHEME_RE
        .captures(&scrubbed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .ok_or_else(|| validation(format!("URI has no scheme: {uri}")))?;

    if FORBIDDEN_SCHEMES.contains(&scheme.as_str()) {
        return Err(validation(format!("forbidden URI scheme: {scheme}")));
    }
    if !ALLOWED_SCHEMES.contains(&scheme.as_str()) {
        return Err(validation(format!("unsupported URI scheme: {scheme}")));
    }
    Ok(scrubbed)
}

// ─── Metadata ─────────────────────────────────────────────────────────────────

/// Sanitize an open key/value bag: keys are scrubbed, values must be
/// JSON scalars (strings are scrubbed in place).
fn sanitize_metadata(
    metadata: &BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, serde_json::Value>, A2aError> {
    let mut out = BTreeMap::new();
    for (key, value) in metadata {
        let key = scrub_control_chars(key);
        if key.is_empty() {
            return Err(validation("metadata key is empty after sanitization"));
        }
        let value = match value {
            serde_json::Value::String(s) => serde_json::Value::String(scrub_control_chars(s)),
            serde_json::Value::Number(_)
            | serde_json::Value::Bool(_)
            | serde_json::Value::Null => value.clone(),
            _ => {
                return Err(validation(format!(
                    "metadata value for '{key}' must be a scalar"
                )))
            }
        };
        out.insert(key, value);
    }
    Ok(out)
}

fn sanitize_metadata_opt(
    metadata: &Option<BTreeMap<String, serde_json::Value>>,
) -> Result<Option<BTreeMap<String, serde_json::Value>>, A2aError> {
    metadata.as_ref().map(sanitize_metadata).transpose()
}

// ─── Parts ────────────────────────────────────────────────────────────────────

fn sanitize_part(part: &Part, limits: &SanitizeLimits) -> Result<Part, A2aError> {
    match part {
        Part::Text { text, metadata } => {
            if text.len() > limits.max_text_len {
                return Err(validation(format!(
                    "text part exceeds {} bytes",
                    limits.max_text_len
                )));
            }
            Ok(Part::Text {
                text: scrub_control_chars(text),
                metadata: sanitize_metadata_opt(metadata)?,
            })
        }
        Part::File { file, metadata } => {
            let name = file.name.as_deref().map(sanitize_filename);
            let mime_type = file
                .mime_type
                .as_deref()
                .map(sanitize_mime_type)
                .transpose()?;
            let uri = file.uri.as_deref().map(sanitize_uri).transpose()?;
            Ok(Part::File {
                file: FileContent {
                    name,
                    mime_type,
                    bytes: file.bytes.clone(),
                    uri,
                },
                metadata: sanitize_metadata_opt(metadata)?,
            })
        }
        Part::Data { data, metadata } => {
            // Must round-trip through JSON serialization without error.
            let serialized = serde_json::to_string(data)
                .map_err(|e| validation(format!("data part is not serializable: {e}")))?;
            let data: serde_json::Value = serde_json::from_str(&serialized)
                .map_err(|e| validation(format!("data part does not round-trip: {e}")))?;
            Ok(Part::Data {
                data,
                metadata: sanitize_metadata_opt(metadata)?,
            })
        }
    }
}

// ─── Entry point ──────────────────────────────────────────────────────────────

/// Validate and normalize an inbound message.
///
/// Returns the sanitized copy, or the first violated rule as
/// [`A2aError::Validation`]. Never mutates its input.
pub fn sanitize_message(message: &Message, limits: &SanitizeLimits) -> Result<Message, A2aError> {
    let message_id = scrub_control_chars(&message.message_id);
    if message_id.is_empty() {
        return Err(validation("messageId must be a nonempty string"));
    }
    if message_id.len() > MAX_ID_LEN {
        return Err(validation(format!(
            "messageId exceeds {MAX_ID_LEN} characters"
        )));
    }

    if message.parts.is_empty() {
        return Err(validation("message must contain at least one part"));
    }
    if message.parts.len() > limits.max_parts {
        return Err(validation(format!(
            "message exceeds {} parts",
            limits.max_parts
        )));
    }

    let parts = message
        .parts
        .iter()
        .map(|p| sanitize_part(p, limits))
        .collect::<Result<Vec<_>, _>>()?;

    let sanitized = Message {
        message_id,
        context_id: message
            .context_id
            .as_deref()
            .map(scrub_control_chars)
            .filter(|s| !s.is_empty()),
        task_id: message
            .task_id
            .as_deref()
            .map(scrub_control_chars)
            .filter(|s| !s.is_empty()),
        role: message.role,
        parts,
        metadata: sanitize_metadata_opt(&message.metadata)?,
    };

    let total = serde_json::to_string(&sanitized)
        .map_err(|e| validation(format!("message is not serializable: {e}")))?
        .len();
    if total > limits.max_message_len {
        return Err(validation(format!(
            "message exceeds {} serialized bytes",
            limits.max_message_len
        )));
    }

    Ok(sanitized)
}
