// src/classifier.rs

use crate::client::ProviderError;

/// Closed taxonomy of provider failures. Each kind carries a fixed policy
/// in the dispatch loop; nothing else about an error is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 5xx, network timeout, connection reset. Retried on the same key.
    TransientServer,
    /// 429 or a momentary quota message. Rotate with a short cooldown.
    RateLimit,
    /// 401/403 or an invalid-key message. Rotate with a long cooldown.
    Authentication,
    /// Daily or monthly cap. Key sits out the rest of the day for the model.
    QuotaExhausted,
    /// 400-class schema problems. Surfaced to the caller.
    BadRequest,
    /// Input too large for the model. Surfaced to the caller.
    ContextLength,
    /// Anything uncategorized. One capped retry, then rotate.
    Unknown,
}

impl ErrorKind {
    /// Kinds that indict the credential rather than the request or the
    /// provider's health.
    pub fn is_credential(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Authentication | Self::QuotaExhausted
        )
    }

    /// Kinds the caller must see; retry and rotation cannot fix these.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::BadRequest | Self::ContextLength)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientServer => "transient_server",
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::QuotaExhausted => "quota_exhausted",
            Self::BadRequest => "bad_request",
            Self::ContextLength => "context_length",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider message fragments that refine or override the status code.
/// Matched case-insensitively, first hit wins.
const MESSAGE_TABLE: &[(&str, ErrorKind)] = &[
    // Quota exhaustion phrases. Several providers send these on 429, which
    // would otherwise read as a short rate limit.
    ("exceeded your current quota", ErrorKind::QuotaExhausted),
    ("quota exceeded", ErrorKind::QuotaExhausted),
    ("daily limit", ErrorKind::QuotaExhausted),
    ("billing", ErrorKind::QuotaExhausted),
    ("insufficient_quota", ErrorKind::QuotaExhausted),
    // Invalid credentials arrive on 400 from some providers.
    ("api_key_invalid", ErrorKind::Authentication),
    ("api key not valid", ErrorKind::Authentication),
    ("invalid api key", ErrorKind::Authentication),
    ("invalid x-api-key", ErrorKind::Authentication),
    ("permission denied", ErrorKind::Authentication),
    // Context window overruns are 400s with distinctive wording.
    ("context length", ErrorKind::ContextLength),
    ("context_length_exceeded", ErrorKind::ContextLength),
    ("maximum context", ErrorKind::ContextLength),
    ("too many tokens", ErrorKind::ContextLength),
    ("prompt is too long", ErrorKind::ContextLength),
    ("string_above_max_length", ErrorKind::ContextLength),
    // Unknown model is the caller's mistake, not the key's.
    ("model not found", ErrorKind::BadRequest),
    ("unknown model", ErrorKind::BadRequest),
    ("model_not_found", ErrorKind::BadRequest),
    // Soft server-side pushback worth retrying in place.
    ("overloaded", ErrorKind::TransientServer),
    ("please try again", ErrorKind::TransientServer),
    ("resource has been exhausted", ErrorKind::RateLimit),
];

/// Maps a raised provider failure into the closed taxonomy.
///
/// Pure: derived from the error variant, HTTP status if present, and the
/// message table above. Absence of any signal yields [`ErrorKind::Unknown`].
pub fn classify(error: &ProviderError) -> ErrorKind {
    if let Some(kind) = classify_message(error.message()) {
        return kind;
    }

    match error {
        ProviderError::Timeout(_) | ProviderError::Connection(_) => ErrorKind::TransientServer,
        ProviderError::Payload(_) => ErrorKind::Unknown,
        ProviderError::Api { status, .. } => classify_status(*status),
    }
}

fn classify_message(message: &str) -> Option<ErrorKind> {
    let lowered = message.to_lowercase();
    MESSAGE_TABLE
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, kind)| *kind)
}

fn classify_status(status: u16) -> ErrorKind {
    match status {
        400 | 404 | 422 => ErrorKind::BadRequest,
        401 | 403 => ErrorKind::Authentication,
        408 => ErrorKind::TransientServer,
        429 => ErrorKind::RateLimit,
        500..=599 => ErrorKind::TransientServer,
        _ => ErrorKind::Unknown,
    }
}

/// Builds a classifiable error from a mid-stream `{"error": ...}` payload.
/// Providers put the status under `code` or `status`; the message under
/// `message` or as a bare string.
pub fn error_from_stream_payload(payload: &serde_json::Value) -> ProviderError {
    let error = payload.get("error").unwrap_or(payload);
    let message = match error {
        serde_json::Value::String(s) => s.clone(),
        _ => error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unspecified stream error")
            .to_string(),
    };
    let status = error
        .get("code")
        .or_else(|| error.get("status"))
        .and_then(|c| c.as_u64())
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(0);
    ProviderError::Api { status, message }
}
