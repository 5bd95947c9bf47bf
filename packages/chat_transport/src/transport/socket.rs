//! The physical socket boundary: something that, given connect-time
//! parameters, yields a bidirectional stream of [`WireMessage`] frames.

use std::pin::Pin;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, SplitSink};
use futures::{Sink, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::request::{AuthClass, Headers};
use crate::signals::Credentials;
use crate::transport::frame::{self, WireMessage};

/// Connect-time parameters. Anything here is baked into the connection, so
/// changing it requires cycling the socket.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub class: AuthClass,
    pub credentials: Option<Credentials>,
    pub receive_stories: bool,
}

impl ConnectRequest {
    pub fn headers(&self) -> Result<Headers, TransportError> {
        let mut headers = Headers::new();
        if self.class == AuthClass::Identified {
            let creds = self.credentials.as_ref().ok_or_else(|| {
                TransportError::network("identified connection without credentials")
            })?;
            let token = STANDARD.encode(format!("{}:{}", creds.username, creds.password));
            headers.insert("Authorization", format!("Basic {token}"));
        }
        headers.insert(
            "X-Receive-Stories",
            if self.receive_stories { "true" } else { "false" },
        );
        Ok(headers)
    }
}

pub type FrameSink = Pin<Box<dyn Sink<WireMessage, Error = TransportError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<WireMessage, TransportError>>;

/// An established socket, split into its two halves. The stream ending or
/// yielding an error means the socket is dead.
pub struct FramedSocket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> BoxFuture<'static, Result<FramedSocket, TransportError>>;
}

/// Upper bound on the TCP and WebSocket handshake together.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Connector`] over a WebSocket at `{base_url}/v1/websocket/`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base_url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/websocket/", self.base_url.trim_end_matches('/'))
    }
}

fn ws_error(err: tungstenite::Error) -> TransportError {
    TransportError::network(err.to_string())
}

fn protocol_error(err: frame::FrameError) -> TransportError {
    TransportError::network(format!("protocol error: {err}"))
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> BoxFuture<'static, Result<FramedSocket, TransportError>> {
        let url = self.endpoint();
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let mut ws_request = url.as_str().into_client_request().map_err(ws_error)?;
            for (name, value) in request.headers()?.iter() {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                ws_request.headers_mut().insert(name, value);
            }

            debug!(class = %request.class, url = %url, "opening websocket");
            let (ws_stream, _) =
                tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(ws_request))
                    .await
                    .map_err(|_| {
                        TransportError::network(format!(
                            "websocket connect timed out after {connect_timeout:?}"
                        ))
                    })?
                    .map_err(ws_error)?;
            info!(class = %request.class, url = %url, "websocket connected");

            let (write, read): (SplitSink<_, Message>, _) = ws_stream.split();

            let sink = write.sink_map_err(ws_error).with(|message: WireMessage| async move {
                frame::encode(&message)
                    .map(Message::text)
                    .map_err(protocol_error)
            });

            let stream = read.filter_map(|item| async move {
                match item {
                    Ok(Message::Text(text)) => {
                        Some(frame::decode(text.as_bytes()).map_err(protocol_error))
                    }
                    Ok(Message::Binary(bytes)) => {
                        Some(frame::decode(&bytes).map_err(protocol_error))
                    }
                    Ok(Message::Close(close)) => {
                        debug!(?close, "websocket close frame");
                        None
                    }
                    // Ping/pong is answered by tungstenite itself.
                    Ok(_) => None,
                    Err(e) => Some(Err(ws_error(e))),
                }
            });

            Ok(FramedSocket {
                sink: Box::pin(sink),
                stream: stream.boxed(),
            })
        })
    }
}
