use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fxbatch_contracts::runs::{FailureReason, GeneratedImage, GenerationFailure, GenerationResult};
use serde::Deserialize;
use serde_json::Value;

use crate::session::RawResponse;

/// Turns a raw service reply into images or a typed failure.
///
/// Implementations are pure: no I/O, no retries, and identical input always
/// yields an identical result.
pub trait ResponseDecoder: Send + Sync {
    fn decode(&self, response: &RawResponse) -> GenerationResult;

    /// Recognises a moderation refusal inside an error body the transport
    /// surfaced as a client error. `None` means the body is not one.
    fn classify_rejection(&self, body: &str) -> Option<GenerationFailure>;
}

/// Decoder for the `runImageFx` response schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFxDecoder;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    image_panels: Vec<WirePanel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePanel {
    #[serde(default)]
    generated_images: Vec<WireImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireImage {
    encoded_image: String,
    seed: i64,
    #[serde(default)]
    media_generation_id: Option<String>,
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    model_name_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireErrorEnvelope {
    error: WireError,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<WireErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    #[serde(default)]
    reason: Option<String>,
}

impl WireError {
    fn moderation_reason(&self) -> Option<&str> {
        self.details
            .iter()
            .filter_map(|detail| detail.reason.as_deref())
            .find(|reason| is_moderation_reason(reason))
    }

    fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(code) = self.code {
            parts.push(code.to_string());
        }
        if let Some(status) = self.status.as_deref() {
            parts.push(status.to_string());
        }
        if let Some(message) = self.message.as_deref().map(str::trim) {
            if !message.is_empty() {
                parts.push(message.to_string());
            }
        }
        if parts.is_empty() {
            "service returned an error".to_string()
        } else {
            parts.join(" ")
        }
    }
}

fn is_moderation_reason(reason: &str) -> bool {
    let upper = reason.to_ascii_uppercase();
    ["UNSAFE", "FILTER_FAILED", "SAFETY", "POLICY"]
        .iter()
        .any(|marker| upper.contains(marker))
}

impl ResponseDecoder for ImageFxDecoder {
    fn decode(&self, response: &RawResponse) -> GenerationResult {
        let body = response.body.as_str();
        let parsed: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(err) => {
                return malformed(format!("response is not JSON: {err}"), body);
            }
        };

        if parsed.get("error").is_some() {
            if let Some(failure) = self.classify_rejection(body) {
                return GenerationResult::Failure(failure);
            }
            return malformed("response carried a service error".to_string(), body);
        }

        if parsed.get("imagePanels").is_none() {
            return malformed("response has no imagePanels field".to_string(), body);
        }
        let wire: WireResponse = match serde_json::from_value(parsed) {
            Ok(wire) => wire,
            Err(err) => return malformed(format!("unexpected response shape: {err}"), body),
        };

        let wire_images: Vec<WireImage> = wire
            .image_panels
            .into_iter()
            .flat_map(|panel| panel.generated_images)
            .collect();
        if wire_images.is_empty() {
            return GenerationResult::Failure(
                GenerationFailure::new(FailureReason::EmptyResult, "service returned no images")
                    .with_excerpt(body),
            );
        }

        let mut images = Vec::with_capacity(wire_images.len());
        for (index, wire_image) in wire_images.into_iter().enumerate() {
            match decode_image(index as u32, wire_image) {
                Ok(image) => images.push(image),
                Err(message) => {
                    return GenerationResult::failure(FailureReason::DecodeError, message);
                }
            }
        }
        GenerationResult::Success { images }
    }

    fn classify_rejection(&self, body: &str) -> Option<GenerationFailure> {
        let envelope: WireErrorEnvelope = serde_json::from_str(body).ok()?;
        let reason = envelope.error.moderation_reason()?;
        Some(
            GenerationFailure::new(
                FailureReason::ContentPolicyRejected,
                format!("prompt rejected by moderation ({reason})"),
            )
            .with_excerpt(&envelope.error.summary()),
        )
    }
}

fn malformed(message: String, body: &str) -> GenerationResult {
    GenerationResult::Failure(
        GenerationFailure::new(FailureReason::MalformedResponse, message).with_excerpt(body),
    )
}

fn decode_image(index: u32, wire: WireImage) -> Result<GeneratedImage, String> {
    let payload = strip_data_uri(&wire.encoded_image)
        .map_err(|err| format!("image {index}: {err}"))?;
    let bytes = BASE64
        .decode(payload.trim().as_bytes())
        .map_err(|err| format!("image {index}: base64 decode failed: {err}"))?;
    let format = image::guess_format(&bytes)
        .map_err(|_| format!("image {index}: bytes are not a recognised image format"))?;
    let extension = format
        .extensions_str()
        .first()
        .copied()
        .unwrap_or("bin")
        .to_string();

    Ok(GeneratedImage {
        index,
        seed: wire.seed,
        format: extension,
        bytes,
        media_generation_id: wire.media_generation_id.filter(|id| !id.is_empty()),
        workflow_id: wire.workflow_id.filter(|id| !id.is_empty()),
        model_name_type: wire.model_name_type.filter(|name| !name.is_empty()),
    })
}

/// Accepts bare base64 or a `data:<mime>;base64,<payload>` URI.
fn strip_data_uri(raw: &str) -> Result<&str, &'static str> {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("data:") else {
        return Ok(trimmed);
    };
    let (header, payload) = rest
        .split_once(',')
        .ok_or("data URI has no payload separator")?;
    if !header.ends_with(";base64") {
        return Err("data URI is not base64 encoded");
    }
    Ok(payload)
}
