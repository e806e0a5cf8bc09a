use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum_macros::{Display, EnumString};

use crate::error::{AppError, Result};

// ============================================================================
// Chat Requests
// ============================================================================

/// Which backend operation a submission targets. Chat mode holds a
/// conversation; generate mode is the one-shot text/code completion path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChatMode {
    Chat,
    Generate,
}

impl ChatMode {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Chat => "/api/chat",
            Self::Generate => "/api/generate",
        }
    }
}

/// Sampling knobs forwarded verbatim to the backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

impl ChatOptions {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.top_p.is_none() && self.top_k.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub prompt: String,
    pub mode: ChatMode,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ChatOptions>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, mode: ChatMode) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            mode,
            images: Vec::new(),
            format: None,
            options: None,
            stream: true,
        }
    }
}

// ============================================================================
// Streamed Response Events
// ============================================================================

/// One decoded event payload. Non-streaming responses parse to the same
/// shape: a single chunk carrying the whole `response` text.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseChunk {
    pub response: Option<String>,
    #[serde(default)]
    pub done: bool,
    pub error: Option<String>,
}

impl ResponseChunk {
    pub fn fragment(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// A payload carrying neither text, sentinel, nor error is malformed.
    pub fn is_empty(&self) -> bool {
        self.response.is_none() && !self.done && self.error.is_none()
    }
}

/// Progress event for a model pull, same wire framing as chat chunks.
#[derive(Debug, Clone, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    pub digest: Option<String>,
    pub total: Option<u64>,
    pub completed: Option<u64>,
    pub error: Option<String>,
}

impl PullProgress {
    pub fn percent(&self) -> Option<f64> {
        match (self.completed, self.total) {
            (Some(done), Some(total)) if total > 0 => Some(done as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

// ============================================================================
// Model Listing & Process Status
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessStatus {
    #[serde(default)]
    pub models: Vec<RunningModel>,
}

// ============================================================================
// Structured Output Formats
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ImageObject {
    pub name: String,
    pub confidence: f32,
    pub attributes: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum Setting {
    Indoor,
    Outdoor,
    Unknown,
}

/// Schema-constrained result of a vision analysis request (the comic
/// analysis feature asks the backend to fill exactly this shape).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ImageAnalysis {
    pub summary: String,
    pub objects: Vec<ImageObject>,
    pub scene: String,
    pub colors: Vec<String>,
    pub time_of_day: TimeOfDay,
    pub setting: Setting,
    pub text_content: Option<String>,
}

/// JSON schema for [`ImageAnalysis`], sent as the request `format` field
/// so the backend constrains its output to parseable JSON.
pub fn analysis_format() -> serde_json::Value {
    schemars::schema_for!(ImageAnalysis).to_value()
}

// ============================================================================
// Image Attachments
// ============================================================================

/// A base64-encoded image ready for a multimodal request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub data: String,
    pub mime_type: String,
}

impl ImageAttachment {
    /// Read and encode an image file. Rejects paths whose type does not
    /// look like an image before touching the filesystem.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        if mime.type_() != mime_guess::mime::IMAGE {
            return Err(AppError::attachment(format!(
                "{} is not an image (detected {})",
                path.display(),
                mime
            )));
        }
        let bytes = std::fs::read(path)
            .map_err(|e| AppError::attachment(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(Self::from_bytes(&bytes, mime.to_string()))
    }

    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            data: BASE64.encode(bytes),
            mime_type: mime_type.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_omits_empty_fields() {
        let request = ChatRequest::new("llama3.2", "hello", ChatMode::Chat);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama3.2");
        assert_eq!(json["prompt"], "hello");
        assert_eq!(json["mode"], "chat");
        assert_eq!(json["stream"], true);
        assert!(json.get("images").is_none());
        assert!(json.get("format").is_none());
        assert!(json.get("options").is_none());
    }

    #[test]
    fn test_chat_request_carries_images_and_options() {
        let mut request = ChatRequest::new("llava", "describe this", ChatMode::Generate);
        request.images.push("aGVsbG8=".to_string());
        request.options = Some(ChatOptions {
            temperature: Some(0.2),
            top_p: None,
            top_k: Some(40),
        });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["mode"], "generate");
        assert_eq!(json["images"][0], "aGVsbG8=");
        assert_eq!(json["options"]["top_k"], 40);
        assert!(json["options"].get("top_p").is_none());
    }

    #[test]
    fn test_chat_mode_parses_and_displays() {
        assert_eq!("chat".parse::<ChatMode>().unwrap(), ChatMode::Chat);
        assert_eq!(ChatMode::Generate.to_string(), "generate");
        assert!("banana".parse::<ChatMode>().is_err());
    }

    #[test]
    fn test_response_chunk_shapes() {
        let chunk: ResponseChunk = serde_json::from_str(r#"{"response":"hi"}"#).unwrap();
        assert_eq!(chunk.fragment(), Some("hi"));
        assert!(!chunk.done);

        let sentinel: ResponseChunk = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert!(sentinel.done);
        assert!(sentinel.fragment().is_none());

        let empty: ResponseChunk = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_pull_progress_percent() {
        let progress: PullProgress =
            serde_json::from_str(r#"{"status":"downloading","completed":50,"total":200}"#).unwrap();
        assert_eq!(progress.percent(), Some(25.0));

        let no_total: PullProgress = serde_json::from_str(r#"{"status":"verifying"}"#).unwrap();
        assert!(no_total.percent().is_none());
    }

    #[test]
    fn test_model_list_tolerates_missing_fields() {
        let list: ModelList =
            serde_json::from_str(r#"{"models":[{"name":"llama3.2"}]}"#).unwrap();
        assert_eq!(list.models[0].name, "llama3.2");
        assert_eq!(list.models[0].size, 0);
    }

    #[test]
    fn test_analysis_format_is_an_object_schema() {
        let schema = analysis_format();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"].get("summary").is_some());
        assert!(schema["properties"].get("time_of_day").is_some());
    }

    #[test]
    fn test_analysis_roundtrip() {
        let analysis = ImageAnalysis {
            summary: "a dog on a beach".to_string(),
            objects: vec![ImageObject {
                name: "dog".to_string(),
                confidence: 0.97,
                attributes: "golden retriever".to_string(),
            }],
            scene: "beach".to_string(),
            colors: vec!["yellow".to_string(), "blue".to_string()],
            time_of_day: TimeOfDay::Afternoon,
            setting: Setting::Outdoor,
            text_content: None,
        };
        let json = serde_json::to_string(&analysis).unwrap();
        let back: ImageAnalysis = serde_json::from_str(&json).unwrap();
        assert_eq!(back, analysis);
    }

    #[test]
    fn test_attachment_rejects_non_image() {
        let err = ImageAttachment::from_path("notes.txt").unwrap_err();
        assert!(err.message.contains("not an image"));
    }

    #[test]
    fn test_attachment_encodes_bytes() {
        let attachment = ImageAttachment::from_bytes(b"hello", "image/png");
        assert_eq!(attachment.data, "aGVsbG8=");
        assert_eq!(attachment.mime_type, "image/png");
    }
}
