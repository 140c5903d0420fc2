use serde::{Deserialize, Serialize};

const EXCERPT_MAX_CHARS: usize = 512;

/// Why a prompt did not produce images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidRequest,
    Timeout,
    ConnectionFailed,
    Unauthorized,
    RateLimited,
    ServerError,
    ClientError,
    MalformedResponse,
    EmptyResult,
    ContentPolicyRejected,
    DecodeError,
    AuthAborted,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::InvalidRequest => "invalid_request",
            FailureReason::Timeout => "timeout",
            FailureReason::ConnectionFailed => "connection_failed",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::ServerError => "server_error",
            FailureReason::ClientError => "client_error",
            FailureReason::MalformedResponse => "malformed_response",
            FailureReason::EmptyResult => "empty_result",
            FailureReason::ContentPolicyRejected => "content_policy_rejected",
            FailureReason::DecodeError => "decode_error",
            FailureReason::AuthAborted => "auth_aborted",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationFailure {
    pub reason: FailureReason,
    pub message: String,
    /// Leading part of the raw service response, for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl GenerationFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            excerpt: None,
        }
    }

    pub fn with_excerpt(mut self, raw: &str) -> Self {
        let trimmed = raw.trim();
        self.excerpt = if trimmed.is_empty() {
            None
        } else {
            Some(truncate_text(trimmed, EXCERPT_MAX_CHARS))
        };
        self
    }
}

impl std::fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// A decoded image and the metadata the service reported for it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    /// Position in the service response.
    pub index: u32,
    pub seed: i64,
    /// File extension sniffed from the bytes (`png`, `jpg`, `webp`, ...).
    pub format: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_generation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name_type: Option<String>,
}

impl std::fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedImage")
            .field("index", &self.index)
            .field("seed", &self.seed)
            .field("format", &self.format)
            .field("bytes", &self.bytes.len())
            .field("media_generation_id", &self.media_generation_id)
            .finish()
    }
}

/// Outcome of decoding one service response. A prompt either yields all of
/// its images or is flagged; there is no partial success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GenerationResult {
    Success { images: Vec<GeneratedImage> },
    Failure(GenerationFailure),
}

impl GenerationResult {
    pub fn failure(reason: FailureReason, message: impl Into<String>) -> Self {
        GenerationResult::Failure(GenerationFailure::new(reason, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GenerationResult::Success { .. })
    }

    pub fn images(&self) -> &[GeneratedImage] {
        match self {
            GenerationResult::Success { images } => images,
            GenerationResult::Failure(_) => &[],
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            GenerationResult::Success { .. } => None,
            GenerationResult::Failure(failure) => Some(failure.reason),
        }
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{FailureReason, GeneratedImage, GenerationFailure, GenerationResult};

    fn image() -> GeneratedImage {
        GeneratedImage {
            index: 0,
            seed: 42,
            format: "png".to_string(),
            bytes: vec![0x89, b'P', b'N', b'G'],
            media_generation_id: Some("media-1".to_string()),
            workflow_id: None,
            model_name_type: None,
        }
    }

    #[test]
    fn excerpts_are_trimmed_and_truncated() {
        let long = "x".repeat(600);
        let failure =
            GenerationFailure::new(FailureReason::MalformedResponse, "bad").with_excerpt(&long);
        let excerpt = failure.excerpt.unwrap_or_default();
        assert_eq!(excerpt.chars().count(), 513);
        assert!(excerpt.ends_with('…'));

        let blank = GenerationFailure::new(FailureReason::EmptyResult, "none").with_excerpt("  ");
        assert!(blank.excerpt.is_none());
    }

    #[test]
    fn results_serialize_with_outcome_tag_and_base64_bytes() -> anyhow::Result<()> {
        let success = GenerationResult::Success {
            images: vec![image()],
        };
        let value = serde_json::to_value(&success)?;
        assert_eq!(value["outcome"], json!("success"));
        assert_eq!(value["images"][0]["bytes"], json!("iVBORw=="));
        assert!(value["images"][0].get("workflow_id").is_none());
        let restored: GenerationResult = serde_json::from_value(value)?;
        assert_eq!(restored, success);

        let failure = GenerationResult::failure(FailureReason::ContentPolicyRejected, "blocked");
        let value: Value = serde_json::to_value(&failure)?;
        assert_eq!(value["outcome"], json!("failure"));
        assert_eq!(value["reason"], json!("content_policy_rejected"));
        Ok(())
    }

    #[test]
    fn accessors_expose_images_and_reason() {
        let success = GenerationResult::Success {
            images: vec![image()],
        };
        assert!(success.is_success());
        assert_eq!(success.images().len(), 1);
        assert_eq!(success.failure_reason(), None);

        let failure = GenerationResult::failure(FailureReason::EmptyResult, "no images");
        assert!(failure.images().is_empty());
        assert_eq!(failure.failure_reason(), Some(FailureReason::EmptyResult));
    }
}
