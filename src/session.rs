use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::ApiClient;
use crate::config::ChatConfig;
use crate::error::{AppError, Result, log_error};
use crate::events::StreamEvent;
use crate::models::{
    ChatMode, ChatOptions, ChatRequest, ImageAnalysis, ImageAttachment, ResponseChunk,
    analysis_format,
};
use crate::stream::SseDecoder;
use crate::transcript::{EntryHandle, EntryStatus, FAILURE_NOTICE, Role, Transcript};

const COMIC_ANALYSIS_PROMPT: &str = "You are looking at a comic panel. Analyze it: summarize \
    what happens, list the objects you can identify with a confidence score, describe the \
    scene and dominant colors, judge the time of day and whether the setting is indoor or \
    outdoor, and transcribe any text in speech bubbles or captions.";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Cancellation Token
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AppError::cancelled())
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Request Manager
// ============================================================================

/// Tracks in-flight requests so a front end can abandon one by id. An id
/// that already finished simply fails to cancel; that race is harmless.
#[derive(Default)]
pub struct RequestManager {
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        lock(&self.active).insert(request_id.to_string(), token.clone());
        token
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        match lock(&self.active).get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, request_id: &str) {
        lock(&self.active).remove(request_id);
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }
}

// ============================================================================
// Submissions
// ============================================================================

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Explicit model override; otherwise picked from config by mode and
    /// whether an image rides along.
    pub model: Option<String>,
    pub mode: ChatMode,
    pub image: Option<ImageAttachment>,
    pub format: Option<serde_json::Value>,
    pub options: Option<ChatOptions>,
    pub stream: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            model: None,
            mode: ChatMode::Chat,
            image: None,
            format: None,
            options: None,
            stream: true,
        }
    }
}

// ============================================================================
// Chat Session
// ============================================================================

/// Drives exchanges against the backend: owns the transcript, enforces the
/// one-stream-at-a-time rule, and pumps response bytes through the decoder
/// into the transcript. Front ends dispatch intents (submit, regenerate,
/// cancel) and render from the transcript or the returned event feed.
pub struct ChatSession {
    api: Arc<ApiClient>,
    config: ChatConfig,
    transcript: Arc<Transcript>,
    requests: Arc<RequestManager>,
    active_chat: Mutex<Option<String>>,
    last_submission: Mutex<Option<(String, SubmitOptions)>>,
}

impl ChatSession {
    pub fn new(config: ChatConfig) -> Result<Self> {
        let api = Arc::new(ApiClient::new(&config)?);
        Ok(Self {
            api,
            config,
            transcript: Arc::new(Transcript::new()),
            requests: Arc::new(RequestManager::new()),
            active_chat: Mutex::new(None),
            last_submission: Mutex::new(None),
        })
    }

    pub fn transcript(&self) -> Arc<Transcript> {
        self.transcript.clone()
    }

    pub fn api(&self) -> Arc<ApiClient> {
        self.api.clone()
    }

    /// Submit a user message. Returns the event feed for this exchange;
    /// fails with Busy while another response is still streaming.
    pub fn submit(&self, prompt: &str, opts: SubmitOptions) -> Result<mpsc::Receiver<StreamEvent>> {
        if prompt.trim().is_empty() {
            return Err(AppError::bad_request("message is required"));
        }
        if self.transcript.is_streaming() {
            return Err(AppError::busy());
        }
        self.transcript
            .append(Role::User, prompt, EntryStatus::Complete);
        *lock(&self.last_submission) = Some((prompt.to_string(), opts.clone()));
        Ok(self.start_exchange(prompt.to_string(), opts))
    }

    /// Discard the last bot response and re-issue the request for the
    /// preceding user message.
    pub fn regenerate(&self) -> Result<mpsc::Receiver<StreamEvent>> {
        if self.transcript.is_streaming() {
            return Err(AppError::busy());
        }
        let Some((prompt, opts)) = lock(&self.last_submission).clone() else {
            return Err(AppError::not_found("Previous exchange"));
        };
        self.transcript.remove_last(Role::Bot);
        Ok(self.start_exchange(prompt, opts))
    }

    /// Abandon the in-flight exchange, if any. The pump stops reading and
    /// drops the transport; text already applied stays visible.
    pub fn cancel(&self) -> bool {
        match lock(&self.active_chat).clone() {
            Some(request_id) => self.requests.cancel(&request_id),
            None => false,
        }
    }

    /// Cancel any tracked request (chat or pull) by its id.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        self.requests.cancel(request_id)
    }

    fn start_exchange(&self, prompt: String, opts: SubmitOptions) -> mpsc::Receiver<StreamEvent> {
        let handle = self.transcript.append(Role::Bot, "", EntryStatus::Pending);
        let request = self.build_request(&prompt, &opts);
        let request_id = Uuid::now_v7().to_string();
        let token = self.requests.register(&request_id);
        *lock(&self.active_chat) = Some(request_id.clone());

        let (tx, rx) = mpsc::channel(64);
        let api = self.api.clone();
        let transcript = self.transcript.clone();
        let requests = self.requests.clone();

        tokio::spawn(async move {
            let _ = tx
                .send(StreamEvent::Started {
                    request_id: request_id.clone(),
                    timestamp: chrono::Utc::now().timestamp(),
                })
                .await;

            let outcome = run_exchange(&api, &request, &transcript, handle, &token, &tx, &request_id).await;

            match outcome {
                Ok(final_result) => {
                    transcript.finalize(handle);
                    let _ = tx
                        .send(StreamEvent::Completed {
                            request_id: request_id.clone(),
                            final_result,
                            timestamp: chrono::Utc::now().timestamp(),
                        })
                        .await;
                }
                Err(err) if err.is_cancelled() => {
                    // Partial text stays; the entry just stops growing.
                    transcript.finalize(handle);
                    let _ = tx
                        .send(StreamEvent::Cancelled {
                            request_id: request_id.clone(),
                            reason: "cancelled by caller".to_string(),
                        })
                        .await;
                }
                Err(err) => {
                    log_error(&err);
                    transcript.fail(handle, FAILURE_NOTICE);
                    let _ = tx
                        .send(StreamEvent::Error {
                            request_id: request_id.clone(),
                            error: err.to_string(),
                            recoverable: err.code.is_recoverable(),
                        })
                        .await;
                }
            }

            requests.unregister(&request_id);
        });

        rx
    }

    fn build_request(&self, prompt: &str, opts: &SubmitOptions) -> ChatRequest {
        let model = opts.model.clone().unwrap_or_else(|| {
            self.config
                .model_for(opts.mode, opts.image.is_some())
                .to_string()
        });
        let mut request = ChatRequest::new(model, prompt, opts.mode);
        if let Some(image) = &opts.image {
            request.images.push(image.data.clone());
        }
        request.format = opts.format.clone();
        request.options = opts.options.filter(|o| !o.is_empty());
        request.stream = opts.stream;
        request
    }

    // ------------------------------------------------------------------
    // Model pulls
    // ------------------------------------------------------------------

    /// Pull a model, forwarding progress over an event feed. Cancellable
    /// via [`ChatSession::cancel_request`] with the feed's request id.
    pub async fn pull_model(&self, name: &str) -> Result<mpsc::Receiver<StreamEvent>> {
        let mut progress = self.api.pull_model(name).await?;
        let request_id = Uuid::now_v7().to_string();
        let token = self.requests.register(&request_id);
        let requests = self.requests.clone();
        let model = name.to_string();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let _ = tx
                .send(StreamEvent::Started {
                    request_id: request_id.clone(),
                    timestamp: chrono::Utc::now().timestamp(),
                })
                .await;

            loop {
                if token.is_cancelled() {
                    let _ = tx
                        .send(StreamEvent::Cancelled {
                            request_id: request_id.clone(),
                            reason: "pull cancelled".to_string(),
                        })
                        .await;
                    break;
                }
                match progress.next().await {
                    Some(Ok(event)) => {
                        if let Some(error) = event.error {
                            let _ = tx
                                .send(StreamEvent::Error {
                                    request_id: request_id.clone(),
                                    error,
                                    recoverable: true,
                                })
                                .await;
                            break;
                        }
                        let _ = tx
                            .send(StreamEvent::PullProgress {
                                request_id: request_id.clone(),
                                status: event.status,
                                completed: event.completed,
                                total: event.total,
                            })
                            .await;
                    }
                    Some(Err(err)) => {
                        log_error(&err);
                        let _ = tx
                            .send(StreamEvent::Error {
                                request_id: request_id.clone(),
                                error: err.to_string(),
                                recoverable: err.code.is_recoverable(),
                            })
                            .await;
                        break;
                    }
                    None => {
                        let _ = tx
                            .send(StreamEvent::Completed {
                                request_id: request_id.clone(),
                                final_result: format!("Model '{}' is ready", model),
                                timestamp: chrono::Utc::now().timestamp(),
                            })
                            .await;
                        break;
                    }
                }
            }

            requests.unregister(&request_id);
        });

        Ok(rx)
    }

    // ------------------------------------------------------------------
    // Comic analysis
    // ------------------------------------------------------------------

    /// Analyze a comic panel image: a non-streaming vision request whose
    /// output the backend constrains to the [`ImageAnalysis`] schema.
    pub async fn analyze_comic(&self, path: impl AsRef<Path>) -> Result<ImageAnalysis> {
        let attachment = ImageAttachment::from_path(path)?;
        let mut request = ChatRequest::new(
            self.config.vision_model.clone(),
            COMIC_ANALYSIS_PROMPT,
            ChatMode::Generate,
        );
        request.images.push(attachment.data);
        request.format = Some(analysis_format());
        request.stream = false;

        let text = self.api.complete(&request).await?;
        serde_json::from_str(&text)
            .map_err(|e| AppError::model(format!("analysis was not valid JSON: {}", e)))
    }
}

// ============================================================================
// Stream Pump
// ============================================================================

async fn run_exchange(
    api: &ApiClient,
    request: &ChatRequest,
    transcript: &Transcript,
    handle: EntryHandle,
    token: &CancellationToken,
    tx: &mpsc::Sender<StreamEvent>,
    request_id: &str,
) -> Result<String> {
    if request.stream {
        let resp = api.send_chat(request).await?;
        pump_stream(Box::pin(resp.bytes_stream()), transcript, handle, token, tx, request_id).await
    } else {
        // Non-streaming fallback: the decoder is bypassed entirely.
        let text = api.complete(request).await?;
        token.check()?;
        transcript.mutate(handle, &text);
        let _ = tx
            .send(StreamEvent::TextChunk {
                request_id: request_id.to_string(),
                chunk: text.clone(),
            })
            .await;
        Ok(text)
    }
}

enum Applied {
    Continue,
    Done,
}

/// Fold a chunked byte stream into the transcript entry behind `handle`.
/// Generic over the transport so tests can script chunk boundaries.
///
/// Fragments apply in arrival order, in the same turn their chunk was
/// read. Returns the assembled text on a clean end (transport closure or
/// an explicit done sentinel, whichever comes first).
pub(crate) async fn pump_stream<S, E>(
    mut stream: S,
    transcript: &Transcript,
    handle: EntryHandle,
    token: &CancellationToken,
    tx: &mpsc::Sender<StreamEvent>,
    request_id: &str,
) -> Result<String>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut decoder = SseDecoder::<ResponseChunk>::new();
    let mut assembled = String::new();

    while let Some(item) = stream.next().await {
        token.check()?;
        let bytes =
            item.map_err(|e| AppError::transport(format!("stream interrupted: {}", e)))?;
        for chunk in decoder.feed(&bytes) {
            if let Applied::Done =
                apply_chunk(&chunk, transcript, handle, tx, request_id, &mut assembled).await?
            {
                return Ok(assembled);
            }
        }
    }
    if let Some(chunk) = decoder.finish() {
        apply_chunk(&chunk, transcript, handle, tx, request_id, &mut assembled).await?;
    }
    Ok(assembled)
}

async fn apply_chunk(
    chunk: &ResponseChunk,
    transcript: &Transcript,
    handle: EntryHandle,
    tx: &mpsc::Sender<StreamEvent>,
    request_id: &str,
    assembled: &mut String,
) -> Result<Applied> {
    if let Some(error) = &chunk.error {
        return Err(AppError::model(error.clone()));
    }
    if let Some(fragment) = chunk.fragment() {
        if transcript.mutate(handle, fragment) {
            assembled.push_str(fragment);
            let _ = tx
                .send(StreamEvent::TextChunk {
                    request_id: request_id.to_string(),
                    chunk: fragment.to_string(),
                })
                .await;
        }
    } else if !chunk.done {
        log::warn!("skipping event with no response, done, or error field");
    }
    if chunk.done {
        Ok(Applied::Done)
    } else {
        Ok(Applied::Continue)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use bytes::Bytes;

    fn scripted(chunks: Vec<std::result::Result<Bytes, String>>) -> impl Stream<Item = std::result::Result<Bytes, String>> + Unpin {
        Box::pin(tokio_stream::iter(chunks))
    }

    fn ok(bytes: &'static [u8]) -> std::result::Result<Bytes, String> {
        Ok(Bytes::from_static(bytes))
    }

    #[tokio::test]
    async fn test_pump_applies_fragments_in_order() {
        let transcript = Transcript::new();
        let handle = transcript.append(Role::Bot, "", EntryStatus::Pending);
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);

        let stream = scripted(vec![
            ok(b"data: {\"response\":\"Hel\"}\ndata: {\"resp"),
            ok(b"onse\":\"lo\"}\n"),
            ok(b"data: {\"response\":\" world\"}\n"),
        ]);
        let assembled = pump_stream(stream, &transcript, handle, &token, &tx, "r1")
            .await
            .unwrap();

        assert_eq!(assembled, "Hello world");
        assert_eq!(transcript.entry(handle).unwrap().content, "Hello world");
        assert_eq!(transcript.entry(handle).unwrap().status, EntryStatus::Streaming);

        drop(tx);
        let mut chunks = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::TextChunk { chunk, .. } = event {
                chunks.push(chunk);
            }
        }
        assert_eq!(chunks, vec!["Hel", "lo", " world"]);
    }

    #[tokio::test]
    async fn test_pump_transport_error_keeps_partial_text() {
        let transcript = Transcript::new();
        let handle = transcript.append(Role::Bot, "", EntryStatus::Pending);
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(64);

        let stream = scripted(vec![
            ok(b"data: {\"response\":\"partial\"}\n"),
            Err("connection reset".to_string()),
        ]);
        let err = pump_stream(stream, &transcript, handle, &token, &tx, "r1")
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::Transport);
        assert_eq!(transcript.entry(handle).unwrap().content, "partial");

        // The session layer reports the failure without discarding text.
        transcript.fail(handle, FAILURE_NOTICE);
        let entry = transcript.entry(handle).unwrap();
        assert!(entry.content.starts_with("partial"));
        assert!(entry.content.ends_with(FAILURE_NOTICE));
    }

    #[tokio::test]
    async fn test_pump_prefers_done_sentinel_over_closure() {
        let transcript = Transcript::new();
        let handle = transcript.append(Role::Bot, "", EntryStatus::Pending);
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(64);

        let stream = scripted(vec![
            ok(b"data: {\"response\":\"all\"}\ndata: {\"done\":true}\n"),
            ok(b"data: {\"response\":\"never read\"}\n"),
        ]);
        let assembled = pump_stream(stream, &transcript, handle, &token, &tx, "r1")
            .await
            .unwrap();

        assert_eq!(assembled, "all");
        assert_eq!(transcript.entry(handle).unwrap().content, "all");
    }

    #[tokio::test]
    async fn test_pump_skips_malformed_lines() {
        let transcript = Transcript::new();
        let handle = transcript.append(Role::Bot, "", EntryStatus::Pending);
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(64);

        let stream = scripted(vec![
            ok(b"data: {\"response\":\"a\"}\ndata: {broken\ndata: {\"response\":\"b\"}"),
        ]);
        let assembled = pump_stream(stream, &transcript, handle, &token, &tx, "r1")
            .await
            .unwrap();
        assert_eq!(assembled, "ab");
    }

    #[tokio::test]
    async fn test_pump_backend_error_event_fails_exchange() {
        let transcript = Transcript::new();
        let handle = transcript.append(Role::Bot, "", EntryStatus::Pending);
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(64);

        let stream = scripted(vec![ok(b"data: {\"error\":\"model exploded\"}\n")]);
        let err = pump_stream(stream, &transcript, handle, &token, &tx, "r1")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelError);
    }

    #[tokio::test]
    async fn test_pump_cancellation_stops_mutations() {
        let transcript = Transcript::new();
        let handle = transcript.append(Role::Bot, "", EntryStatus::Pending);
        let token = CancellationToken::new();
        token.cancel();
        let (tx, _rx) = mpsc::channel(64);

        let stream = scripted(vec![ok(b"data: {\"response\":\"late\"}\n")]);
        let err = pump_stream(stream, &transcript, handle, &token, &tx, "r1")
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(transcript.entry(handle).unwrap().content, "");
    }

    #[tokio::test]
    async fn test_non_streaming_equivalent_to_one_fragment_stream() {
        let streamed = Transcript::new();
        let handle = streamed.append(Role::Bot, "", EntryStatus::Pending);
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(64);
        let stream = scripted(vec![ok(b"data: {\"response\":\"ok\"}\n")]);
        pump_stream(stream, &streamed, handle, &token, &tx, "r1")
            .await
            .unwrap();
        streamed.finalize(handle);

        let direct = Transcript::new();
        let handle = direct.append(Role::Bot, "", EntryStatus::Pending);
        direct.mutate(handle, "ok");
        direct.finalize(handle);

        assert_eq!(streamed.snapshot(), direct.snapshot());
    }

    #[test]
    fn test_request_manager_lifecycle() {
        let manager = RequestManager::new();
        let token = manager.register("r1");
        assert_eq!(manager.active_count(), 1);
        assert!(!token.is_cancelled());

        assert!(manager.cancel("r1"));
        assert!(token.is_cancelled());
        assert!(token.check().is_err());

        manager.unregister("r1");
        assert!(!manager.cancel("r1"));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_and_busy() {
        let session = ChatSession::new(ChatConfig::default()).unwrap();
        let err = session.submit("   ", SubmitOptions::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);

        // Simulate an in-flight response; submission must be refused.
        session
            .transcript()
            .append(Role::Bot, "", EntryStatus::Streaming);
        let err = session.submit("hi", SubmitOptions::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
    }

    #[tokio::test]
    async fn test_regenerate_without_history_fails() {
        let session = ChatSession::new(ChatConfig::default()).unwrap();
        let err = session.regenerate().unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_cancel_without_active_exchange_is_false() {
        let session = ChatSession::new(ChatConfig::default()).unwrap();
        assert!(!session.cancel());
    }
}
