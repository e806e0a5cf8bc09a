use crate::models::ChatMode;

// ============================================================================
// Configuration
// ============================================================================

/// Backend connection settings, read once at startup. Every field has a
/// working local default so a bare `parley` launch talks to a stock
/// backend on localhost.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub chat_model: String,
    pub generate_model: String,
    pub vision_model: String,
    /// Applied to quick management calls (listing, status, create).
    /// Streaming exchanges deliberately get no overall deadline.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl ChatConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("BACKEND_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            chat_model: std::env::var("CHAT_MODEL").unwrap_or_else(|_| "llama3.2".to_string()),
            generate_model: std::env::var("GENERATE_MODEL")
                .unwrap_or_else(|_| "codellama".to_string()),
            vision_model: std::env::var("VISION_MODEL").unwrap_or_else(|_| "llava".to_string()),
            request_timeout_secs: std::env::var("REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            connect_timeout_secs: std::env::var("CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }

    /// Default model for a submission: vision when an image rides along,
    /// otherwise the mode's configured model.
    pub fn model_for(&self, mode: ChatMode, has_image: bool) -> &str {
        if has_image {
            &self.vision_model
        } else {
            match mode {
                ChatMode::Chat => &self.chat_model,
                ChatMode::Generate => &self.generate_model,
            }
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            chat_model: "llama3.2".to_string(),
            generate_model: "codellama".to_string(),
            vision_model: "llava".to_string(),
            request_timeout_secs: 120,
            connect_timeout_secs: 10,
        }
    }
}
