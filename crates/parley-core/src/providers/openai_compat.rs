//! OpenAI-compatible streaming agent
//!
//! Works against any `/chat/completions` endpoint that supports
//! `stream: true` and function tools (OpenAI, OpenRouter, Ollama, LM Studio).

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentTurn, DeltaStream, ToolCall};
use crate::sse::SseParser;

const DEFAULT_INSTRUCTIONS: &str = "You are a helpful assistant with access to multiple tools. \
Use tools to respond. Do not alter the user's input when passing it as a tool argument. \
If the input has the form `@name message`, `name` is the tool to invoke with `message` unchanged. \
If the input has the form `@name key:value`, invoke `name` with argument `key` set to `value` unchanged.";

/// Configuration for an OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    /// Author name shown on assistant fragments
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub instructions: String,
    pub temperature: f32,
    /// Maximum model round trips that may end in tool calls
    pub max_tool_rounds: usize,
    pub request_timeout: Duration,
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            name: "Assistant".to_string(),
            base_url: "http://localhost:11434/v1".to_string(),
            model: "qwen3:4b".to_string(),
            api_key: None,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            temperature: 0.0,
            max_tool_rounds: 8,
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Agent backed by a streaming chat-completions endpoint
pub struct OpenAiCompatAgent {
    http: reqwest::Client,
    config: Arc<OpenAiCompatConfig>,
}

impl OpenAiCompatAgent {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        info!(
            "Using OpenAI-compatible agent {} at {}",
            config.model, config.base_url
        );
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl Agent for OpenAiCompatAgent {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn stream(&self, turn: AgentTurn) -> Result<DeltaStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let http = self.http.clone();
        let config = Arc::clone(&self.config);
        let task = tokio::spawn(async move {
            if let Err(e) = run_turn(&http, &config, turn, &tx).await {
                let _ = tx.send(Err(e));
            }
        });
        Ok(Box::pin(TaskStream::new(rx, task)))
    }
}

/// Receiver for a producer task that is aborted when the stream is dropped.
/// A producer that dies by panicking ends the stream with an error.
struct TaskStream {
    rx: mpsc::UnboundedReceiver<Result<String>>,
    task: JoinHandle<()>,
    finished: bool,
}

impl TaskStream {
    fn new(rx: mpsc::UnboundedReceiver<Result<String>>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task,
            finished: false,
        }
    }
}

impl Stream for TaskStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(None) => {}
            other => return other,
        }
        match Pin::new(&mut this.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(outcome) => {
                this.finished = true;
                match outcome {
                    Err(e) if e.is_panic() => {
                        Poll::Ready(Some(Err(anyhow!("Model stream task panicked"))))
                    }
                    _ => Poll::Ready(None),
                }
            }
        }
    }
}

impl Drop for TaskStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct StreamedCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct RoundOutput {
    text: String,
    calls: BTreeMap<u64, StreamedCall>,
}

impl RoundOutput {
    /// Fold one streamed chunk in, returning its content delta if any
    fn apply_chunk(&mut self, chunk: &Value) -> Option<String> {
        let delta = chunk.get("choices")?.get(0)?.get("delta")?;

        if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
            for call in calls {
                let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                    entry.id = id.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                        entry.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                        entry.arguments.push_str(args);
                    }
                }
            }
        }

        let content = delta.get("content").and_then(|c| c.as_str())?;
        if content.is_empty() {
            return None;
        }
        self.text.push_str(content);
        Some(content.to_string())
    }

    fn into_calls(self) -> (String, Vec<StreamedCall>) {
        let calls = self
            .calls
            .into_iter()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, mut call)| {
                if call.id.is_empty() {
                    call.id = format!("call_{index}");
                }
                call
            })
            .collect();
        (self.text, calls)
    }
}

async fn run_turn(
    http: &reqwest::Client,
    config: &OpenAiCompatConfig,
    turn: AgentTurn,
    tx: &mpsc::UnboundedSender<Result<String>>,
) -> Result<()> {
    let mut messages: Vec<Value> = Vec::new();
    if !config.instructions.is_empty() {
        messages.push(json!({"role": "system", "content": config.instructions}));
    }
    for message in turn.history.iter().chain(turn.input.iter()) {
        messages.push(json!({"role": message.role.to_string(), "content": message.content}));
    }

    let tools: Vec<Value> = turn
        .tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect();

    for round in 0..=config.max_tool_rounds {
        let offer_tools = round < config.max_tool_rounds && !tools.is_empty();
        let output = request_round(http, config, &messages, offer_tools.then_some(&tools), tx).await?;
        let (text, calls) = output.into_calls();

        if calls.is_empty() {
            return Ok(());
        }
        debug!("Model requested {} tool call(s) in round {}", calls.len(), round);

        let tool_calls: Vec<Value> = calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.name, "arguments": c.arguments},
                })
            })
            .collect();
        let content = if text.is_empty() { Value::Null } else { Value::String(text) };
        messages.push(json!({"role": "assistant", "content": content, "tool_calls": tool_calls}));

        for call in calls {
            let arguments = parse_arguments(&call.arguments);
            let result = match turn
                .invoker
                .invoke(ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments,
                })
                .await
            {
                Ok(result) => result,
                Err(e) => format!("Error: {e}"),
            };
            messages.push(json!({"role": "tool", "tool_call_id": call.id, "content": result}));
        }
    }

    warn!(
        "Stopped after {} tool rounds without a final answer",
        config.max_tool_rounds
    );
    Ok(())
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!("Model produced invalid tool arguments ({}): {}", e, raw);
        json!({})
    })
}

async fn request_round(
    http: &reqwest::Client,
    config: &OpenAiCompatConfig,
    messages: &[Value],
    tools: Option<&Vec<Value>>,
    tx: &mpsc::UnboundedSender<Result<String>>,
) -> Result<RoundOutput> {
    let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
    let mut body = json!({
        "model": config.model,
        "messages": messages,
        "stream": true,
        "temperature": config.temperature,
    });
    if let Some(tools) = tools {
        body["tools"] = Value::Array(tools.clone());
    }

    let mut request = http.post(&url).json(&body);
    if let Some(key) = &config.api_key {
        request = request.bearer_auth(key);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to reach model endpoint {}", url))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("Model request failed: HTTP {}: {}", status, body));
    }

    let mut output = RoundOutput::default();
    let mut parser = SseParser::new();
    let mut bytes = response.bytes_stream();

    'read: while let Some(chunk) = bytes.next().await {
        let chunk = chunk.context("Model stream interrupted")?;
        for event in parser.push(&chunk) {
            if event.data.trim() == "[DONE]" {
                break 'read;
            }
            forward_event(&event.data, &mut output, tx)?;
        }
    }
    if let Some(event) = parser.finish()
        && event.data.trim() != "[DONE]"
    {
        forward_event(&event.data, &mut output, tx)?;
    }

    Ok(output)
}

fn forward_event(
    data: &str,
    output: &mut RoundOutput,
    tx: &mpsc::UnboundedSender<Result<String>>,
) -> Result<()> {
    let chunk: Value = serde_json::from_str(data).with_context(|| {
        let preview: String = data.chars().take(100).collect();
        format!("Invalid stream chunk: {}", preview)
    })?;
    if let Some(error) = chunk.get("error") {
        return Err(anyhow!("Model stream error: {}", error));
    }
    if let Some(delta) = output.apply_chunk(&chunk) {
        let _ = tx.send(Ok(delta));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_deltas_accumulate() {
        let mut output = RoundOutput::default();
        let first = json!({"choices": [{"delta": {"role": "assistant", "content": "Hel"}}]});
        let second = json!({"choices": [{"delta": {"content": "lo"}}]});
        assert_eq!(output.apply_chunk(&first).as_deref(), Some("Hel"));
        assert_eq!(output.apply_chunk(&second).as_deref(), Some("lo"));
        assert_eq!(output.text, "Hello");
    }

    #[test]
    fn test_tool_call_fragments_merge_by_index() {
        let mut output = RoundOutput::default();
        let chunks = [
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "get", "arguments": ""}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"city\":"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"Paris\"}"}}
            ]}}]}),
        ];
        for chunk in &chunks {
            assert!(output.apply_chunk(chunk).is_none());
        }
        let (text, calls) = output.into_calls();
        assert!(text.is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].name, "get");
        assert_eq!(parse_arguments(&calls[0].arguments)["city"], "Paris");
    }

    #[test]
    fn test_missing_call_id_is_synthesized() {
        let mut output = RoundOutput::default();
        output.apply_chunk(&json!({"choices": [{"delta": {"tool_calls": [
            {"index": 2, "function": {"name": "echo", "arguments": "{}"}}
        ]}}]}));
        let (_, calls) = output.into_calls();
        assert_eq!(calls[0].id, "call_2");
    }

    #[test]
    fn test_parse_arguments_tolerates_garbage() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("{not json"), json!({}));
        assert_eq!(parse_arguments("{\"a\":1}")["a"], 1);
    }

    #[test]
    fn test_forward_event_surfaces_stream_errors() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut output = RoundOutput::default();
        let err = forward_event(r#"{"error":{"message":"overloaded"}}"#, &mut output, &tx)
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn test_invalid_chunk_preview_respects_char_boundaries() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut output = RoundOutput::default();
        let data = format!("{}é trailing", "x".repeat(99));
        let err = forward_event(&data, &mut output, &tx).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Invalid stream chunk"));
        assert!(message.ends_with('é'));
    }

    #[tokio::test]
    async fn test_panicking_producer_ends_with_error() {
        let (tx, rx) = mpsc::unbounded_channel::<Result<String>>();
        let task = tokio::spawn(async move {
            if tx.send(Ok("partial".to_string())).is_ok() {
                panic!("producer failed");
            }
        });
        let mut stream = TaskStream::new(rx, task);

        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_finished_producer_ends_cleanly() {
        let (tx, rx) = mpsc::unbounded_channel::<Result<String>>();
        let task = tokio::spawn(async move {
            let _ = tx.send(Ok("done".to_string()));
        });
        let mut stream = TaskStream::new(rx, task);

        assert_eq!(stream.next().await.unwrap().unwrap(), "done");
        assert!(stream.next().await.is_none());
    }

    struct NoTools;

    #[async_trait]
    impl crate::agent::ToolInvoker for NoTools {
        async fn invoke(&self, _call: ToolCall) -> Result<String> {
            Ok(String::new())
        }
    }

    /// Serve one chat-completions request with a fixed SSE body
    async fn serve_completion(body: String) -> String {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            let mut content_length = 0usize;
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let mut request = vec![0u8; content_length];
            reader.read_exact(&mut request).await.unwrap();

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = reader.get_mut().write_all(response.as_bytes()).await;
            let _ = reader.get_mut().shutdown().await;
        });
        format!("http://{addr}/v1")
    }

    #[tokio::test]
    async fn test_non_ascii_bad_chunk_surfaces_as_error() {
        let body = format!(
            "data: {}\n\ndata: {}é\n\n",
            json!({"choices": [{"delta": {"content": "Hi"}}]}),
            "x".repeat(99)
        );
        let base_url = serve_completion(body).await;
        let agent = OpenAiCompatAgent::new(OpenAiCompatConfig {
            base_url,
            request_timeout: Duration::from_secs(5),
            ..OpenAiCompatConfig::default()
        })
        .unwrap();

        let mut stream = agent
            .stream(AgentTurn {
                history: Vec::new(),
                input: vec![crate::providers::ChatMessage::user("hello")],
                tools: Vec::new(),
                invoker: Arc::new(NoTools),
            })
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "Hi");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("Invalid stream chunk"));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_default_config() {
        let config = OpenAiCompatConfig::default();
        assert_eq!(config.name, "Assistant");
        assert_eq!(config.temperature, 0.0);
        assert!(config.max_tool_rounds > 0);
    }
}
