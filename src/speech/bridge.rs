//! # Speech Service Bridge
//!
//! One WebSocket connection to the speech service per call, driven by two
//! concurrent loops: a sender draining the audio window queue and a receiver
//! fanning results out through the session registry.
//!
//! The receiver owns the end of the session: whichever way the stream
//! terminates (service close, read error, post-flush drain) the registry
//! entry is removed and subscribers get their closing sentinel from exactly
//! one place.
//!
//! Both loops are generic over the sink/stream pair so tests can drive them
//! with in-memory channels instead of a live connection.

use crate::audio::{AudioFormat, MixedWindow, TRACKS};
use crate::config::SpeechConfig;
use crate::registry::SessionRegistry;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Item on the audio queue between ingest and the sender loop.
#[derive(Debug)]
pub enum SpeechInput {
    /// One interleaved two-track window.
    Window(MixedWindow),
    /// No more audio will come; written to the service as an empty frame.
    Flush,
}

#[derive(Debug)]
pub enum BridgeError {
    /// The request could not be built (bad URL or credentials).
    Request(String),
    /// The WebSocket handshake failed.
    Connect(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Request(msg) => write!(f, "Speech request invalid: {}", msg),
            BridgeError::Connect(msg) => write!(f, "Speech connection failed: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

/// An open streaming-recognition connection, ready to be split into its
/// sender and receiver halves.
pub struct UpstreamBridge {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl UpstreamBridge {
    /// Open the streaming connection for one call.
    ///
    /// The service is told the exact wire format the mixer produces: mulaw,
    /// the configured sample rate, and one channel per track with
    /// multichannel results.
    pub async fn connect(
        speech: &SpeechConfig,
        audio: &AudioFormat,
    ) -> Result<Self, BridgeError> {
        let url = format!(
            "{}?encoding=mulaw&sample_rate={}&channels={}&multichannel=true",
            speech.listen_url, audio.sample_rate, TRACKS
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| BridgeError::Request(e.to_string()))?;
        let auth = format!("Token {}", speech.api_key)
            .parse()
            .map_err(|_| BridgeError::Request("API key is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        debug!(status = %response.status(), "Speech service connected");

        Ok(Self { ws })
    }

    /// Spawn the relay for one call and detach.
    pub fn spawn(
        self,
        audio_rx: mpsc::UnboundedReceiver<SpeechInput>,
        call_sid_rx: oneshot::Receiver<String>,
        registry: SessionRegistry,
        flush_grace: Duration,
    ) {
        tokio::spawn(async move {
            let (sink, stream) = self.ws.split();
            relay(sink, stream, audio_rx, call_sid_rx, registry, flush_grace).await;
        });
    }
}

/// Drive one call's bridge to completion.
///
/// When the sender finishes first (flush written), the receiver is given
/// `flush_grace` to drain buffered results before the session is torn down;
/// when the receiver finishes first the teardown is immediate. Either way
/// `end_session` runs exactly once from here.
pub async fn relay<Si, St>(
    sink: Si,
    stream: St,
    audio_rx: mpsc::UnboundedReceiver<SpeechInput>,
    call_sid_rx: oneshot::Receiver<String>,
    registry: SessionRegistry,
    flush_grace: Duration,
) where
    Si: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let sender = tokio::spawn(run_sender(audio_rx, sink));

    // Ingest reveals the call id once the start event names it. If that
    // never happens there is no session to tear down.
    let call_sid = call_sid_rx.await.ok();

    let forward = run_receiver(stream, call_sid.clone(), registry.clone());
    tokio::pin!(forward);

    let receiver_done = tokio::select! {
        _ = &mut forward => true,
        _ = sender => false,
    };

    if !receiver_done {
        // The flush is on the wire; give the service a bounded window to
        // return whatever it still holds.
        if tokio::time::timeout(flush_grace, &mut forward).await.is_err() {
            warn!(
                call_sid = ?call_sid,
                grace_ms = flush_grace.as_millis() as u64,
                "Speech service did not close after flush, tearing down"
            );
        }
    }

    if let Some(call_sid) = &call_sid {
        registry.end_session(call_sid);
    }
}

/// Forward queued windows to the service in arrival order.
///
/// Ends after writing the flush frame, after a write error, or when every
/// queue sender is gone.
async fn run_sender<Si>(mut audio_rx: mpsc::UnboundedReceiver<SpeechInput>, mut sink: Si)
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let mut windows: u64 = 0;
    while let Some(input) = audio_rx.recv().await {
        match input {
            SpeechInput::Window(window) => {
                if let Err(e) = sink.send(Message::binary(window.bytes)).await {
                    warn!(error = %e, windows, "Speech service write failed, stopping sender");
                    return;
                }
                windows += 1;
            }
            SpeechInput::Flush => {
                // An empty frame tells the service the stream is complete.
                if let Err(e) = sink.send(Message::binary(Vec::new())).await {
                    debug!(error = %e, "Flush write failed, connection already down");
                }
                break;
            }
        }
    }
    debug!(windows, "Speech sender finished");
}

/// Read results off the service stream and fan them out.
///
/// Delivery must never block: the registry broadcast only pushes into
/// unbounded subscriber queues. Any read error or close frame ends the loop.
async fn run_receiver<St>(mut stream: St, call_sid: Option<String>, registry: SessionRegistry)
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Text(payload)) => match &call_sid {
                Some(call_sid) => {
                    let delivered = registry.broadcast(call_sid, &payload);
                    debug!(call_sid = %call_sid, delivered, "Speech result forwarded");
                }
                None => debug!("Dropping speech result for a call with no identity"),
            },
            Ok(Message::Binary(bytes)) => {
                debug!(bytes = bytes.len(), "Ignoring binary message from speech service");
            }
            Ok(Message::Close(frame)) => {
                info!(call_sid = ?call_sid, frame = ?frame, "Speech service closed the stream");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Err(e) => {
                warn!(call_sid = ?call_sid, error = %e, "Speech service read failed");
                break;
            }
        }
    }
}
