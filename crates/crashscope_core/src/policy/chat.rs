//! Policy backed by an OpenAI-compatible `/chat/completions` endpoint.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::prompt::{build_prompt, INSTRUCTIONS};
use super::Policy;
use crate::observation::Observation;
use crate::state::HistoryEntry;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8045/v1";

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub stream: bool,
    pub history_window: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            stream: true,
            history_window: 8,
        }
    }
}

impl ChatConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    /// `CRASHSCOPE_LLM_BASE_URL`, `CRASHSCOPE_LLM_MODEL`, `CRASHSCOPE_LLM_API_KEY`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("CRASHSCOPE_LLM_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(model) = std::env::var("CRASHSCOPE_LLM_MODEL") {
            config.model = model;
        }
        config.api_key = std::env::var("CRASHSCOPE_LLM_API_KEY").ok();
        config
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Deserialize, Debug)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ModelEntry {
    pub id: String,
    /// Set by servers that also host embedding models.
    #[serde(default)]
    pub model_type: Option<String>,
}

impl ModelEntry {
    fn is_llm(&self) -> bool {
        self.model_type.as_deref().map_or(true, |kind| kind == "llm")
    }
}

/// The preferred model when the server offers it, otherwise the first LLM.
pub fn select_model(models: &[ModelEntry], preferred: &str) -> Option<String> {
    let mut llms = models.iter().filter(|model| model.is_llm());
    if let Some(model) = llms.clone().find(|model| model.id == preferred) {
        return Some(model.id.clone());
    }
    let fallback = llms.next()?;
    warn!(preferred, selected = %fallback.id, "preferred model not offered, using another");
    Some(fallback.id.clone())
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    temperature: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct ChatCompletionResponse {
    pub choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
pub struct Choice {
    pub message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
pub struct ResponseMessage {
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TextChunk(String),
    Done,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Clone)]
pub struct ChatClient {
    config: ChatConfig,
    client: Client,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build reqwest client")?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// `GET {base_url}/models`. Doubles as a reachability check.
    pub async fn list_models(&self) -> Result<Vec<ModelEntry>> {
        let url = self.config.models_url();
        let mut request = self.client.get(&url).timeout(Duration::from_secs(10));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request
            .send()
            .await
            .with_context(|| format!("Model backend unreachable at {}", self.config.base_url))?;
        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Listing models failed ({status}): {error_text}"));
        }
        let list: ModelList = resp.json().await.context("Failed to parse model list")?;
        Ok(list.data)
    }

    /// Posts the request, retrying 429, 5xx and network errors with
    /// exponential backoff.
    async fn post_with_retry(&self, messages: &[Message], stream: bool) -> Result<reqwest::Response> {
        let url = self.config.completions_url();
        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            stream: stream.then_some(true),
            temperature: 0.0,
        };

        let mut retry_count = 0;
        let mut delay = self.config.base_delay;
        loop {
            let mut request = self.client.post(&url).json(&body);
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }
            debug!(url = %url, model = %self.config.model, stream, "sending chat completion request");

            match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let retryable = status == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || status.is_server_error();
                    if !retryable || retry_count >= self.config.max_retries {
                        let error_text = resp
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        return Err(anyhow::anyhow!("API error ({status}): {error_text}"));
                    }
                    warn!(%status, retry_count, delay_ms = delay.as_millis() as u64, "chat request failed, retrying");
                }
                Err(e) => {
                    if retry_count >= self.config.max_retries {
                        return Err(anyhow::anyhow!("Network error: {e}"));
                    }
                    warn!(error = %e, retry_count, delay_ms = delay.as_millis() as u64, "chat request failed, retrying");
                }
            }

            sleep(delay).await;
            retry_count += 1;
            delay *= 2;
        }
    }

    pub async fn chat_completion(&self, messages: &[Message]) -> Result<String> {
        let resp = self.post_with_retry(messages, false).await?;
        let body: ChatCompletionResponse = resp
            .json()
            .await
            .context("Failed to parse API response")?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("API response has no message content"))
    }

    pub async fn chat_completion_stream(
        &self,
        messages: &[Message],
    ) -> Result<impl Stream<Item = Result<StreamEvent>>> {
        let resp = self.post_with_retry(messages, true).await?;
        Ok(SseStream::new(resp.bytes_stream()))
    }

    /// Streams the completion and joins the text chunks.
    pub async fn collect_stream(&self, messages: &[Message]) -> Result<String> {
        let stream = self.chat_completion_stream(messages).await?;
        futures_util::pin_mut!(stream);
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextChunk(chunk) => text.push_str(&chunk),
                StreamEvent::Done => break,
            }
        }
        Ok(text)
    }
}

/// Policy that asks a chat model for the next command.
pub struct ChatPolicy {
    client: ChatClient,
    bug_description: String,
}

impl ChatPolicy {
    pub fn new(config: ChatConfig, bug_description: impl Into<String>) -> Result<Self> {
        let client = ChatClient::new(config)?;
        info!(model = %client.config().model, base_url = %client.config().base_url, "chat policy ready");
        Ok(Self {
            client,
            bug_description: bug_description.into(),
        })
    }

    /// Like [`ChatPolicy::new`], but first asks the server which models it
    /// offers and switches to another LLM when the configured one is missing.
    pub async fn connect(mut config: ChatConfig, bug_description: impl Into<String>) -> Result<Self> {
        let models = ChatClient::new(config.clone())?.list_models().await?;
        config.model = select_model(&models, &config.model)
            .ok_or_else(|| anyhow::anyhow!("No LLM models offered by {}", config.base_url))?;
        Self::new(config, bug_description)
    }

    pub fn model(&self) -> &str {
        &self.client.config().model
    }
}

#[async_trait]
impl Policy for ChatPolicy {
    async fn decide(&mut self, observation: &Observation, history: &[HistoryEntry]) -> Result<String> {
        let prompt = build_prompt(
            &self.bug_description,
            observation,
            history,
            self.client.config().history_window,
        );
        let messages = [Message::system(INSTRUCTIONS), Message::user(prompt)];

        let reply = if self.client.config().stream {
            self.client.collect_stream(&messages).await?
        } else {
            self.client.chat_completion(&messages).await?
        };
        debug!(reply = %reply.trim(), "chat policy replied");
        Ok(reply)
    }

    fn name(&self) -> &str {
        "chat"
    }
}

/// Server-sent events from a streaming completion, one text chunk per item.
pub struct SseStream<S> {
    inner: S,
    buffer: Vec<u8>,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }
}

impl<S, B> Stream for SseStream<S>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = self.buffer.drain(..pos + 1).collect();
                let line = String::from_utf8_lossy(&line_bytes);
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    return Poll::Ready(Some(Ok(StreamEvent::Done)));
                }
                match serde_json::from_str::<StreamChunk>(data) {
                    Ok(chunk) => {
                        let content = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|choice| choice.delta.content)
                            .filter(|content| !content.is_empty());
                        if let Some(content) = content {
                            return Poll::Ready(Some(Ok(StreamEvent::TextChunk(content))));
                        }
                    }
                    Err(e) => debug!(error = %e, "skipping unparseable SSE chunk"),
                }
                continue;
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.buffer.extend_from_slice(chunk.as_ref()),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(anyhow::Error::from(e)))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObservationConfig;
    use crate::observation::build_observation;
    use crate::state::SessionState;
    use futures_util::stream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn chunk(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    #[tokio::test]
    async fn sse_stream_joins_chunks_split_across_reads() {
        let payload = format!("{}{}: keep-alive\ndata: [DONE]\n\n", chunk("-exec"), chunk("-run"));
        let bytes = payload.into_bytes();
        let (a, b) = bytes.split_at(17);
        let inner = stream::iter(vec![
            Ok::<Vec<u8>, reqwest::Error>(a.to_vec()),
            Ok(b.to_vec()),
        ]);

        let events: Vec<_> = SseStream::new(inner)
            .map(|event| event.expect("no transport errors"))
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                StreamEvent::TextChunk("-exec".into()),
                StreamEvent::TextChunk("-run".into()),
                StreamEvent::Done
            ]
        );
    }

    /// Serves the canned HTTP responses in order, one per connection.
    async fn serve(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                read_request(&mut socket).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/v1")
    }

    /// Consumes headers and a `Content-Length` body so the socket closes cleanly.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let Ok(n) = socket.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                return;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            let Some(header_end) = text.find("\r\n\r\n") else {
                continue;
            };
            let length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= header_end + 4 + length {
                return;
            }
        }
    }

    fn http(status: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn chat_policy_retries_server_errors_then_streams_reply() {
        let sse = format!("{}data: [DONE]\n\n", chunk("-stack-list-frames"));
        let base_url = serve(vec![
            http("503 Service Unavailable", "text/plain", "busy"),
            http("200 OK", "text/event-stream", &sse),
        ])
        .await;

        let config = ChatConfig {
            base_delay: Duration::from_millis(10),
            ..ChatConfig::new(base_url, "test-model")
        };
        let mut policy = ChatPolicy::new(config, "segfault on long input").expect("client");
        let state = SessionState::new("/nonexistent/a.out");
        let observation = build_observation(&state, &[], &ObservationConfig::default());

        let reply = policy.decide(&observation, &[]).await.expect("reply");
        assert_eq!(reply, "-stack-list-frames");
    }

    fn entry(id: &str, model_type: Option<&str>) -> ModelEntry {
        ModelEntry {
            id: id.to_string(),
            model_type: model_type.map(str::to_string),
        }
    }

    #[test]
    fn select_model_prefers_configured_then_first_llm() {
        let models = vec![
            entry("all-minilm", Some("embedding")),
            entry("llama3.2:3b", Some("llm")),
            entry("qwen2.5-coder", None),
        ];
        assert_eq!(select_model(&models, "qwen2.5-coder").as_deref(), Some("qwen2.5-coder"));
        assert_eq!(select_model(&models, "gpt-4o-mini").as_deref(), Some("llama3.2:3b"));
        assert_eq!(select_model(&models, "all-minilm").as_deref(), Some("llama3.2:3b"));
        assert_eq!(select_model(&[entry("all-minilm", Some("embedding"))], "x"), None);
    }

    #[tokio::test]
    async fn connect_checks_the_model_list() {
        let models = serde_json::json!({"object": "list", "data": [
            {"id": "nomic-embed", "model_type": "embedding"},
            {"id": "llama3.2:3b", "object": "model"}
        ]})
        .to_string();
        let base_url = serve(vec![
            http("200 OK", "application/json", &models),
            http("200 OK", "application/json", r#"{"data": []}"#),
        ])
        .await;

        let policy = ChatPolicy::connect(ChatConfig::new(base_url.clone(), "missing-model"), "crash")
            .await
            .expect("fallback model");
        assert_eq!(policy.model(), "llama3.2:3b");

        let err = ChatPolicy::connect(ChatConfig::new(base_url, "missing-model"), "crash")
            .await
            .err()
            .expect("empty model list");
        assert!(err.to_string().contains("No LLM models"));
    }

    #[tokio::test]
    async fn connect_reports_unreachable_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = ChatPolicy::connect(ChatConfig::new(format!("http://{addr}/v1"), "m"), "crash")
            .await
            .err()
            .expect("nothing listens there");
        assert!(err.to_string().contains("unreachable"));
    }

    #[tokio::test]
    async fn non_streaming_reply_and_client_errors() {
        let body = serde_json::json!({"choices": [{"message": {"content": "DONE: found it"}}]}).to_string();
        let base_url = serve(vec![
            http("200 OK", "application/json", &body),
            http("401 Unauthorized", "text/plain", "bad key"),
        ])
        .await;

        let config = ChatConfig {
            stream: false,
            max_retries: 0,
            ..ChatConfig::new(base_url, "test-model")
        };
        let client = ChatClient::new(config).expect("client");
        let messages = [Message::user("hi")];
        assert_eq!(
            client.chat_completion(&messages).await.expect("reply"),
            "DONE: found it"
        );

        let err = client.chat_completion(&messages).await.expect_err("401 is not retried");
        assert!(err.to_string().contains("401"));
        assert!(err.to_string().contains("bad key"));
    }
}
