use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::codec::SseDecoder;
use crate::errors::{StreamError, TransportError};

use super::{Subscription, Transport, TransportRequest};

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Configuration for [`HttpSseTransport`].
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// Base URL of the chat backend.
    pub base_url: String,
    /// Limit for establishing the connection.
    pub connect_timeout: Duration,
    /// Longest silence tolerated between body chunks. Streams of any total
    /// length stay open as long as chunks keep arriving.
    pub read_timeout: Duration,
    /// Whether the backend honors `resume_from`.
    pub resume_supported: bool,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(120),
            resume_supported: true,
        }
    }

    /// Builds a config from `STOCKCHAT_API_URL` (default `http://localhost:8000`).
    pub fn from_env() -> Self {
        let base_url = std::env::var("STOCKCHAT_API_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "http://localhost:8000".to_string());
        Self::new(base_url)
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn resume_supported(mut self, supported: bool) -> Self {
        self.resume_supported = supported;
        self
    }

    pub(crate) fn turns_url(&self) -> String {
        format!("{}/v1/chat/turns", self.base_url.trim_end_matches('/'))
    }
}

/// Streams turns from the chat backend over HTTP server-sent events.
pub struct HttpSseTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpSseTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, StreamError> {
        if config.base_url.trim().is_empty() {
            return Err(StreamError::Config("base_url must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, StreamError> {
        Self::new(HttpTransportConfig::from_env())
    }
}

#[async_trait::async_trait]
impl Transport for HttpSseTransport {
    fn name(&self) -> &str {
        "http-sse"
    }

    fn supports_resume(&self) -> bool {
        self.config.resume_supported
    }

    async fn subscribe(&self, request: TransportRequest) -> Result<Subscription, TransportError> {
        let body = build_request_body(&request);
        debug!(
            turn_id = %request.turn_id,
            session_id = %request.session_id,
            attempt = request.attempt,
            resume_from = ?request.resume_from,
            "opening turn subscription"
        );

        let response = self
            .client
            .post(self.config.turns_url())
            .bearer_auth(request.credential.expose())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::disconnected(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            let message = format!("backend responded with status {status}: {body}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                TransportError::disconnected(message)
            } else {
                TransportError::rejected(message, Some(status.as_u16()))
            });
        }

        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(Subscription::new(Box::pin(sse_data_stream(bytes_stream))))
    }
}

pub(crate) fn build_request_body(request: &TransportRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "turn_id": request.turn_id.as_str(),
        "session_id": request.session_id,
        "query": request.query,
        "stream": true,
    });
    if let Some(resume_from) = request.resume_from {
        body["resume_from"] = serde_json::json!(resume_from);
    }
    body
}

fn sse_data_stream(
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<String, TransportError>> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<String>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes_stream,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(data) = state.pending.pop_front() {
                    return Ok(Some((data, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        for frame in state.decoder.push_chunk(&chunk) {
                            if !frame.data.trim().is_empty() {
                                state.pending.push_back(frame.data);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        return Err(TransportError::disconnected(format!(
                            "stream read failed: {e}"
                        )));
                    }
                    None => {
                        if state.decoder.has_partial() {
                            debug!("stream closed with a partial SSE record");
                        }
                        state.done = true;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionToken;
    use crate::frame::TurnId;

    fn request(resume_from: Option<u64>) -> TransportRequest {
        TransportRequest {
            turn_id: TurnId::new("t1"),
            session_id: uuid::Uuid::nil(),
            query: "Analyze TCS".into(),
            credential: SessionToken::new("token"),
            resume_from,
            attempt: 1,
        }
    }

    #[test]
    fn request_body_carries_turn_and_query() {
        let body = build_request_body(&request(None));
        assert_eq!(body.get("turn_id").and_then(|v| v.as_str()), Some("t1"));
        assert_eq!(body.get("query").and_then(|v| v.as_str()), Some("Analyze TCS"));
        assert_eq!(body.get("stream").and_then(|v| v.as_bool()), Some(true));
        assert!(body.get("resume_from").is_none());
    }

    #[test]
    fn request_body_includes_resume_point() {
        let body = build_request_body(&request(Some(3)));
        assert_eq!(body.get("resume_from").and_then(|v| v.as_u64()), Some(3));
    }

    #[test]
    fn turns_url_trims_trailing_slash() {
        let config = HttpTransportConfig::new("http://localhost:8000/");
        assert_eq!(config.turns_url(), "http://localhost:8000/v1/chat/turns");
    }

    #[test]
    fn timeouts_bound_connect_and_idle_reads_only() {
        let config = HttpTransportConfig::new("http://localhost:8000");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_secs(120));
        let config = config.read_timeout(Duration::from_secs(5));
        assert_eq!(config.read_timeout, Duration::from_secs(5));
    }

    /// Serves one SSE response whose events are written with `gap` between them.
    async fn serve_sse(events: Vec<&'static str>, gap: Duration) -> String {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buf = [0_u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.expect("read request");
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
                )
                .await
                .expect("write head");
            for event in events {
                let record = format!("data: {event}\n\n");
                let chunk = format!("{:x}\r\n{record}\r\n", record.len());
                if socket.write_all(chunk.as_bytes()).await.is_err() {
                    return;
                }
                tokio::time::sleep(gap).await;
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn long_stream_survives_as_long_as_chunks_keep_arriving() {
        let events = vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#, r#"{"n":4}"#];
        let base_url = serve_sse(events, Duration::from_millis(150)).await;
        let transport = HttpSseTransport::new(
            HttpTransportConfig::new(base_url).read_timeout(Duration::from_millis(400)),
        )
        .expect("transport");
        let subscription = transport.subscribe(request(None)).await.expect("subscribe");
        let raw: Vec<String> = subscription
            .stream
            .map(|item| item.expect("data"))
            .collect()
            .await;
        assert_eq!(raw.len(), 4);
        assert_eq!(raw[3], "{\"n\":4}");
    }

    #[tokio::test]
    async fn stalled_stream_is_a_transient_disconnect() {
        let base_url = serve_sse(vec!["{\"n\":1}", "{\"n\":2}"], Duration::from_secs(3)).await;
        let transport = HttpSseTransport::new(
            HttpTransportConfig::new(base_url).read_timeout(Duration::from_millis(200)),
        )
        .expect("transport");
        let mut subscription = transport.subscribe(request(None)).await.expect("subscribe");
        assert_eq!(
            subscription.stream.next().await.map(|item| item.expect("first")),
            Some("{\"n\":1}".to_string())
        );
        match subscription.stream.next().await {
            Some(Err(error)) => assert!(error.is_transient(), "{error}"),
            other => panic!("expected a read timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sse_stream_yields_data_across_chunks() {
        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"event: text_delta\ndata: {\"a\":")),
            Ok(bytes::Bytes::from_static(b"1}\n\n: ping\n\ndata: {\"b\":2}\n\n")),
        ];
        let raw: Vec<String> = sse_data_stream(Box::pin(stream::iter(chunks)))
            .map(|item| item.expect("data"))
            .collect()
            .await;
        assert_eq!(raw, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[tokio::test]
    async fn env_gated_smoke_subscribe_if_backend_configured() {
        if std::env::var("STOCKCHAT_API_URL").unwrap_or_default().trim().is_empty()
            || std::env::var("STOCKCHAT_SESSION_TOKEN")
                .unwrap_or_default()
                .trim()
                .is_empty()
        {
            eprintln!("skipping backend smoke test (STOCKCHAT_API_URL / STOCKCHAT_SESSION_TOKEN missing)");
            return;
        }
        let transport = HttpSseTransport::from_env().expect("transport");
        let mut req = request(None);
        req.credential = SessionToken::from_env().expect("token");
        req.turn_id = TurnId::generate();
        let result = transport.subscribe(req).await;
        assert!(result.is_ok(), "subscribe failed: {:?}", result.err());
    }
}
