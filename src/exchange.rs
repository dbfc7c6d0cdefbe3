use crate::decoder::{charset_of, decode_body, ContentDecoder, ContentEncoding, StreamDecoder};
use crate::error::ExchangeError;
use crate::renderer::{DisplayTarget, RenderOptions, StreamRenderer};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

const ANSWER_FIELDS: [&str; 3] = ["html_response", "result", "response"];
const ERROR_FIELDS: [&str; 2] = ["error", "detail"];
const ERROR_BODY_LIMIT: usize = 4096;

/// One submitted prompt. Only constructed from a prompt with visible content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeRequest {
    #[serde(rename = "user_prompt")]
    prompt: String,
    #[serde(rename = "api_url", skip_serializing_if = "Option::is_none")]
    endpoint_url: Option<String>,
    #[serde(rename = "model_name", skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
}

impl ExchangeRequest {
    pub fn new(prompt: &str) -> Option<Self> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return None;
        }
        Some(ExchangeRequest {
            prompt: prompt.to_string(),
            endpoint_url: None,
            model_name: None,
        })
    }

    pub fn with_endpoint_url(mut self, endpoint_url: Option<&str>) -> Self {
        self.endpoint_url = non_blank(endpoint_url);
        self
    }

    pub fn with_model_name(mut self, model_name: Option<&str>) -> Self {
        self.model_name = non_blank(model_name);
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn endpoint_url(&self) -> Option<&str> {
        self.endpoint_url.as_deref()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    /// `application/x-www-form-urlencoded` body: `user_prompt`, then `api_url` and `model_name` when set.
    pub fn form_body(&self) -> Result<String, ExchangeError> {
        serde_urlencoded::to_string(self)
            .map_err(|e| ExchangeError::Protocol(format!("cannot encode request: {e}")))
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    /// JSON when the server says `application/json`, streamed text otherwise.
    #[default]
    Auto,
    Json,
    Stream,
}

impl FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ResponseFormat::Auto),
            "json" => Ok(ResponseFormat::Json),
            "stream" => Ok(ResponseFormat::Stream),
            other => Err(format!(
                "unknown response format '{other}' (expected auto, json or stream)"
            )),
        }
    }
}

impl Display for ResponseFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ResponseFormat::Auto => write!(f, "auto"),
            ResponseFormat::Json => write!(f, "json"),
            ResponseFormat::Stream => write!(f, "stream"),
        }
    }
}

/// Everything the caller decides about an exchange besides the prompt itself.
#[derive(Debug, Clone, Default)]
pub struct ExchangeConfig {
    pub endpoint_url: Option<String>,
    pub model_name: Option<String>,
    pub render: RenderOptions,
    pub format: ResponseFormat,
}

impl ExchangeConfig {
    pub fn request(&self, prompt: &str) -> Option<ExchangeRequest> {
        Some(
            ExchangeRequest::new(prompt)?
                .with_endpoint_url(self.endpoint_url.as_deref())
                .with_model_name(self.model_name.as_deref()),
        )
    }
}

/// Status line and body of a response whose body has not been read yet.
pub struct Reply<B> {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub body: B,
}

#[allow(async_fn_in_trait)]
pub trait ResponseBody {
    /// Next piece of the body as delivered by the network, `None` at the end.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ExchangeError>;
}

#[allow(async_fn_in_trait)]
pub trait Transport {
    type Body: ResponseBody;

    async fn send(&self, request: &ExchangeRequest) -> Result<Reply<Self::Body>, ExchangeError>;
}

/// Lets whoever started an exchange abandon it. Cancelling twice, or after the
/// exchange finished, does nothing.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        CancelHandle { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

enum Interrupted {
    Exchange(ExchangeError),
    Display(io::Error),
}

impl From<ExchangeError> for Interrupted {
    fn from(e: ExchangeError) -> Self {
        Interrupted::Exchange(e)
    }
}

impl From<io::Error> for Interrupted {
    fn from(e: io::Error) -> Self {
        Interrupted::Display(e)
    }
}

/// Submits a prompt. Blank prompts are dropped here and never reach the network.
pub async fn submit<T, D>(
    transport: &T,
    config: &ExchangeConfig,
    prompt: &str,
    target: D,
    cancel: &CancelHandle,
) -> io::Result<Option<StreamRenderer<D>>>
where
    T: Transport,
    D: DisplayTarget,
{
    let Some(request) = config.request(prompt) else {
        debug!("blank prompt, nothing submitted");
        return Ok(None);
    };
    run(transport, &request, target, config, cancel).await.map(Some)
}

/// Drives one exchange to a terminal state. An `Err` means the display itself failed.
pub async fn run<T, D>(
    transport: &T,
    request: &ExchangeRequest,
    target: D,
    config: &ExchangeConfig,
    cancel: &CancelHandle,
) -> io::Result<StreamRenderer<D>>
where
    T: Transport,
    D: DisplayTarget,
{
    let mut renderer = StreamRenderer::begin(target, config.render.clone())?;
    debug!(
        prompt_len = request.prompt().len(),
        model = request.model_name().unwrap_or("-"),
        format = %config.format,
        "sending prompt"
    );

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Exchange(ExchangeError::Cancelled)),
        reply = transport.send(request) => match reply {
            Ok(reply) => deliver(&mut renderer, reply, config.format, cancel).await,
            Err(e) => Err(e.into()),
        },
    };

    match outcome {
        Ok(()) => {}
        Err(Interrupted::Exchange(ExchangeError::Cancelled)) => {
            renderer.cancel();
        }
        Err(Interrupted::Exchange(e)) => {
            renderer.on_error(&e)?;
        }
        Err(Interrupted::Display(e)) => {
            renderer.cancel();
            return Err(e);
        }
    }

    Ok(renderer)
}

async fn deliver<B, D>(
    renderer: &mut StreamRenderer<D>,
    reply: Reply<B>,
    format: ResponseFormat,
    cancel: &CancelHandle,
) -> Result<(), Interrupted>
where
    B: ResponseBody,
    D: DisplayTarget,
{
    let Reply {
        status,
        content_type,
        content_encoding,
        mut body,
    } = reply;
    debug!(status, content_type = content_type.as_deref().unwrap_or("-"), "response received");

    let encoding = ContentEncoding::from_header(content_encoding.as_deref());
    let charset = charset_of(content_type.as_deref());

    if !(200..300).contains(&status) {
        // The status is reported even when the error body cannot be read.
        let detail = match read_all(&mut body, cancel, ERROR_BODY_LIMIT).await {
            Ok(raw) => encoding
                .ok()
                .and_then(|encoding| decode_body(&raw, encoding, charset).ok())
                .and_then(|text| error_detail(&text)),
            Err(ExchangeError::Cancelled) => return Err(ExchangeError::Cancelled.into()),
            Err(_) => None,
        };
        return Err(ExchangeError::HttpStatus { status, detail }.into());
    }
    let encoding = encoding?;

    let json = match format {
        ResponseFormat::Json => true,
        ResponseFormat::Stream => false,
        ResponseFormat::Auto => content_type.as_deref().is_some_and(is_json),
    };

    if json {
        let raw = read_all(&mut body, cancel, usize::MAX).await?;
        let text = decode_body(&raw, encoding, charset)?;
        let answer = extract_answer(&text)?;
        renderer.on_chunk(answer.as_bytes())?;
        renderer.on_complete()?;
        return Ok(());
    }

    if let Some(charset) = charset {
        renderer.set_decoder(StreamDecoder::new(charset));
    }
    let mut content = ContentDecoder::new(encoding).map_err(ExchangeError::from)?;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExchangeError::Cancelled.into()),
            chunk = body.next_chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            break;
        };

        let plain = content.decode(chunk).map_err(ExchangeError::from)?;
        if !plain.is_empty() {
            renderer.on_chunk(&plain)?;
        }
    }

    let tail = content.finish().map_err(ExchangeError::from)?;
    if !tail.is_empty() {
        renderer.on_chunk(&tail)?;
    }
    renderer.on_complete()?;
    Ok(())
}

async fn read_all<B: ResponseBody>(
    body: &mut B,
    cancel: &CancelHandle,
    limit: usize,
) -> Result<Bytes, ExchangeError> {
    let mut buf = BytesMut::new();
    while buf.len() < limit {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
            chunk = body.next_chunk() => chunk?,
        };
        match chunk {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => break,
        }
    }
    buf.truncate(limit);
    Ok(buf.freeze())
}

fn is_json(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or("").trim();
    mime.eq_ignore_ascii_case("application/json") || mime.to_ascii_lowercase().ends_with("+json")
}

fn field_text(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Picks the answer out of a single JSON reply.
pub fn extract_answer(text: &str) -> Result<String, ExchangeError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ExchangeError::Protocol(format!("response is not valid JSON: {e}")))?;

    if let Some(answer) = ANSWER_FIELDS.iter().find_map(|key| field_text(&value, key)) {
        return Ok(answer);
    }
    if let Some(message) = ERROR_FIELDS.iter().find_map(|key| field_text(&value, key)) {
        return Err(ExchangeError::Protocol(format!("server reported: {message}")));
    }
    Err(ExchangeError::Protocol(format!(
        "response has none of the fields {}",
        ANSWER_FIELDS.join(", ")
    )))
}

fn error_detail(text: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return ERROR_FIELDS.iter().find_map(|key| field_text(&value, key));
    }
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(line.chars().take(200).collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::renderer::tests::{Event, RecordingTarget};
    use crate::renderer::{ExchangeState, RenderMode, DEFAULT_COMPLETE_MARKER};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::Write;

    pub struct MockBody {
        chunks: VecDeque<Result<Bytes, ExchangeError>>,
        cancel_when_drained: Option<CancelHandle>,
    }

    impl ResponseBody for MockBody {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, ExchangeError> {
            match self.chunks.pop_front() {
                Some(chunk) => chunk.map(Some),
                None => match &self.cancel_when_drained {
                    Some(cancel) => {
                        cancel.cancel();
                        std::future::pending().await
                    }
                    None => Ok(None),
                },
            }
        }
    }

    #[derive(Clone)]
    pub struct Canned {
        status: u16,
        content_type: Option<String>,
        content_encoding: Option<String>,
        chunks: Vec<Result<Bytes, ExchangeError>>,
        cancel_when_drained: Option<CancelHandle>,
    }

    impl Canned {
        pub fn ok(chunks: &[&str]) -> Self {
            Canned::raw(200, chunks.iter().map(|c| c.as_bytes().to_vec()).collect())
        }

        pub fn raw(status: u16, chunks: Vec<Vec<u8>>) -> Self {
            Canned {
                status,
                content_type: Some("text/plain".to_string()),
                content_encoding: None,
                chunks: chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect(),
                cancel_when_drained: None,
            }
        }

        fn content_type(mut self, value: &str) -> Self {
            self.content_type = Some(value.to_string());
            self
        }

        fn content_encoding(mut self, value: &str) -> Self {
            self.content_encoding = Some(value.to_string());
            self
        }

        fn then_fail(mut self, err: ExchangeError) -> Self {
            self.chunks.push(Err(err));
            self
        }

        fn then_cancel(mut self, cancel: &CancelHandle) -> Self {
            self.cancel_when_drained = Some(cancel.clone());
            self
        }
    }

    pub struct MockTransport {
        reply: Result<Canned, ExchangeError>,
        pub sent: RefCell<Vec<ExchangeRequest>>,
    }

    impl MockTransport {
        pub fn new(reply: Canned) -> Self {
            MockTransport {
                reply: Ok(reply),
                sent: RefCell::new(Vec::new()),
            }
        }

        fn failing(err: ExchangeError) -> Self {
            MockTransport {
                reply: Err(err),
                sent: RefCell::new(Vec::new()),
            }
        }
    }

    impl Transport for MockTransport {
        type Body = MockBody;

        async fn send(&self, request: &ExchangeRequest) -> Result<Reply<MockBody>, ExchangeError> {
            self.sent.borrow_mut().push(request.clone());
            let canned = self.reply.clone()?;
            Ok(Reply {
                status: canned.status,
                content_type: canned.content_type,
                content_encoding: canned.content_encoding,
                body: MockBody {
                    chunks: canned.chunks.into_iter().collect(),
                    cancel_when_drained: canned.cancel_when_drained,
                },
            })
        }
    }

    fn config() -> ExchangeConfig {
        ExchangeConfig::default()
    }

    async fn exchange(
        transport: &MockTransport,
        config: &ExchangeConfig,
        prompt: &str,
    ) -> Option<StreamRenderer<RecordingTarget>> {
        submit(
            transport,
            config,
            prompt,
            RecordingTarget::default(),
            &CancelHandle::new(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn request_is_trimmed_and_blank_is_rejected() {
        assert_eq!(ExchangeRequest::new("  hi \n").unwrap().prompt(), "hi");
        assert!(ExchangeRequest::new("").is_none());
        assert!(ExchangeRequest::new(" \t\n ").is_none());
    }

    #[test]
    fn form_body_orders_and_encodes_fields() {
        let request = ExchangeRequest::new("hello world & more?").unwrap();
        assert_eq!(
            request.form_body().unwrap(),
            "user_prompt=hello+world+%26+more%3F"
        );

        let request = request
            .with_endpoint_url(Some("http://localhost:11434/v1"))
            .with_model_name(Some("llama3"));
        assert_eq!(
            request.form_body().unwrap(),
            "user_prompt=hello+world+%26+more%3F&api_url=http%3A%2F%2Flocalhost%3A11434%2Fv1&model_name=llama3"
        );
    }

    #[test]
    fn blank_overrides_are_left_out() {
        let request = ExchangeRequest::new("q")
            .unwrap()
            .with_endpoint_url(Some("  "))
            .with_model_name(None);
        assert_eq!(request.form_body().unwrap(), "user_prompt=q");
    }

    #[test]
    fn response_format_parses() {
        assert_eq!("JSON".parse::<ResponseFormat>(), Ok(ResponseFormat::Json));
        assert_eq!("stream".parse::<ResponseFormat>(), Ok(ResponseFormat::Stream));
        assert!("xml".parse::<ResponseFormat>().is_err());
    }

    #[tokio::test]
    async fn streamed_chunks_render_hello_world() {
        let transport = MockTransport::new(Canned::ok(&["Hel", "lo wor", "ld"]));
        let renderer = exchange(&transport, &config(), "hello").await.unwrap();

        assert_eq!(
            renderer.state(),
            &ExchangeState::Complete("Hello world".to_string())
        );
        assert_eq!(
            renderer.target().rendered(),
            format!("Hello world{DEFAULT_COMPLETE_MARKER}")
        );
        assert_eq!(transport.sent.borrow().len(), 1);
        assert_eq!(transport.sent.borrow()[0].prompt(), "hello");
    }

    #[tokio::test]
    async fn server_error_shows_status_and_never_completes() {
        let transport = MockTransport::new(Canned::raw(500, vec![]));
        let renderer = exchange(&transport, &config(), "hello").await.unwrap();

        let target = renderer.into_target();
        let failures: Vec<&Event> = target
            .events
            .iter()
            .filter(|e| matches!(e, Event::Failed(_)))
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], Event::Failed(m) if m.contains("500")));
        assert_eq!(target.count(|e| matches!(e, Event::Complete(_))), 0);
    }

    #[tokio::test]
    async fn server_error_detail_is_included() {
        let body = r#"{"detail": "An error occurred while processing your request."}"#;
        let transport = MockTransport::new(
            Canned::raw(500, vec![body.as_bytes().to_vec()]).content_type("application/json"),
        );
        let renderer = exchange(&transport, &config(), "hello").await.unwrap();
        assert_eq!(
            renderer.state(),
            &ExchangeState::Failed(
                "server returned status 500: An error occurred while processing your request."
                    .to_string()
            )
        );
    }

    #[tokio::test]
    async fn blank_prompt_never_reaches_transport() {
        let transport = MockTransport::new(Canned::ok(&["unused"]));
        assert!(exchange(&transport, &config(), "").await.is_none());
        assert!(exchange(&transport, &config(), "   \n\t").await.is_none());
        assert!(transport.sent.borrow().is_empty());
    }

    #[tokio::test]
    async fn overrides_travel_with_the_request() {
        let transport = MockTransport::new(Canned::ok(&["ok"]));
        let config = ExchangeConfig {
            endpoint_url: Some("http://llm:8000".to_string()),
            model_name: Some("mistral".to_string()),
            ..ExchangeConfig::default()
        };
        exchange(&transport, &config, "hi").await.unwrap();

        let sent = transport.sent.borrow();
        assert_eq!(sent[0].endpoint_url(), Some("http://llm:8000"));
        assert_eq!(sent[0].model_name(), Some("mistral"));
    }

    #[tokio::test]
    async fn json_result_is_rendered_as_one_answer() {
        let transport = MockTransport::new(
            Canned::ok(&[r#"{"resu"#, r#"lt": "forty two"}"#])
                .content_type("application/json; charset=utf-8"),
        );
        let renderer = exchange(&transport, &config(), "q").await.unwrap();
        assert_eq!(
            renderer.state(),
            &ExchangeState::Complete("forty two".to_string())
        );
        assert_eq!(renderer.target().content(), "forty two");
    }

    #[tokio::test]
    async fn json_html_response_in_markup_mode() {
        let transport = MockTransport::new(
            Canned::ok(&[r#"{"html_response": "<p>Files: <b>3</b></p>"}"#])
                .content_type("application/json"),
        );
        let mut config = config();
        config.render.mode = RenderMode::Markup;
        let renderer = exchange(&transport, &config, "q").await.unwrap();
        assert_eq!(renderer.target().content(), "Files: 3\n");
    }

    #[tokio::test]
    async fn forced_json_format_ignores_content_type() {
        let transport = MockTransport::new(Canned::ok(&[r#"{"response": "hi"}"#]));
        let mut config = config();
        config.format = ResponseFormat::Json;
        let renderer = exchange(&transport, &config, "q").await.unwrap();
        assert_eq!(renderer.target().content(), "hi");
    }

    #[tokio::test]
    async fn json_error_field_is_a_failure() {
        let transport = MockTransport::new(
            Canned::ok(&[r#"{"error": "model not found"}"#]).content_type("application/json"),
        );
        let renderer = exchange(&transport, &config(), "q").await.unwrap();
        assert_eq!(
            renderer.state(),
            &ExchangeState::Failed("unexpected response: server reported: model not found".to_string())
        );
    }

    #[tokio::test]
    async fn json_without_known_fields_is_a_protocol_error() {
        let transport = MockTransport::new(
            Canned::ok(&[r#"{"answer": "?"}"#]).content_type("application/json"),
        );
        let renderer = exchange(&transport, &config(), "q").await.unwrap();
        assert!(matches!(
            renderer.state(),
            ExchangeState::Failed(m) if m.contains("none of the fields")
        ));
        assert_eq!(
            renderer
                .target()
                .count(|e| matches!(e, Event::Complete(_))),
            0
        );
    }

    #[tokio::test]
    async fn connection_drop_mid_stream_keeps_partial_text() {
        let transport = MockTransport::new(
            Canned::ok(&["partial "])
                .then_fail(ExchangeError::Transport("connection reset".to_string())),
        );
        let renderer = exchange(&transport, &config(), "q").await.unwrap();
        assert_eq!(renderer.target().content(), "partial ");
        assert_eq!(
            renderer.state(),
            &ExchangeState::Failed("connection failed: connection reset".to_string())
        );
    }

    #[tokio::test]
    async fn send_failure_is_reported() {
        let transport =
            MockTransport::failing(ExchangeError::Transport("connection refused".to_string()));
        let renderer = exchange(&transport, &config(), "q").await.unwrap();
        assert!(matches!(
            renderer.target().events.last(),
            Some(Event::Failed(m)) if m.contains("connection refused")
        ));
    }

    #[tokio::test]
    async fn gzip_stream_is_decompressed_incrementally() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all("Grüße aus Köln".as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let chunks = compressed.chunks(4).map(|c| c.to_vec()).collect();
        let transport = MockTransport::new(Canned::raw(200, chunks).content_encoding("gzip"));
        let renderer = exchange(&transport, &config(), "q").await.unwrap();
        assert_eq!(
            renderer.state(),
            &ExchangeState::Complete("Grüße aus Köln".to_string())
        );
    }

    #[tokio::test]
    async fn unsupported_encoding_fails_cleanly() {
        let transport = MockTransport::new(Canned::ok(&["x"]).content_encoding("br"));
        let renderer = exchange(&transport, &config(), "q").await.unwrap();
        assert!(matches!(renderer.state(), ExchangeState::Failed(m) if m.contains("br")));
    }

    #[tokio::test]
    async fn server_error_with_unsupported_encoding_still_shows_status() {
        let transport = MockTransport::new(
            Canned::raw(502, vec![b"bad gateway".to_vec()]).content_encoding("br"),
        );
        let renderer = exchange(&transport, &config(), "q").await.unwrap();
        assert_eq!(
            renderer.state(),
            &ExchangeState::Failed("server returned status 502".to_string())
        );
    }

    #[tokio::test]
    async fn charset_from_content_type_is_used_for_streams() {
        let (sjis, _, _) = encoding_rs::SHIFT_JIS.encode("東京タワー");
        let chunks = sjis.chunks(3).map(|c| c.to_vec()).collect();
        let transport = MockTransport::new(
            Canned::raw(200, chunks).content_type("text/plain; charset=shift_jis"),
        );
        let renderer = exchange(&transport, &config(), "q").await.unwrap();
        assert_eq!(renderer.target().content(), "東京タワー");
    }

    #[tokio::test]
    async fn cancel_before_send_writes_nothing_further() {
        let transport = MockTransport::new(Canned::ok(&["never"]));
        let cancel = CancelHandle::new();
        cancel.cancel();

        let renderer = submit(
            &transport,
            &config(),
            "q",
            RecordingTarget::default(),
            &cancel,
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(renderer.state(), &ExchangeState::Cancelled);
        assert_eq!(renderer.target().content(), "");
        assert!(transport.sent.borrow().is_empty());
    }

    #[tokio::test]
    async fn cancel_mid_stream_stops_rendering() {
        let cancel = CancelHandle::new();
        let transport = MockTransport::new(Canned::ok(&["first ", "second"]).then_cancel(&cancel));

        let renderer = submit(
            &transport,
            &config(),
            "q",
            RecordingTarget::default(),
            &cancel,
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(renderer.state(), &ExchangeState::Cancelled);
        assert_eq!(renderer.target().content(), "first second");
        assert_eq!(
            renderer
                .target()
                .count(|e| matches!(e, Event::Complete(_) | Event::Failed(_))),
            0
        );

        cancel.cancel();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn error_detail_reads_json_or_first_line() {
        assert_eq!(
            error_detail(r#"{"detail":"Not Found"}"#),
            Some("Not Found".to_string())
        );
        assert_eq!(
            error_detail("\n  Bad Gateway\nmore"),
            Some("Bad Gateway".to_string())
        );
        assert_eq!(error_detail(""), None);
    }
}
