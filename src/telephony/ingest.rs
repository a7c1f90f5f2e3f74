//! # Media Stream Ingest
//!
//! One WebSocket actor per telephony connection. Text messages run through
//! the [`CallPipeline`] (strict parse, silence fill, window extraction) and
//! full windows are queued to the speech bridge. Synthesized media frames
//! queued by the HTTP side flow back out through the same connection.
//!
//! A malformed message is fatal for its connection: the provider's protocol
//! is versioned and machine-generated, so anything unparseable means the
//! stream state can no longer be trusted.

use crate::audio::{AudioFormat, Track, TrackMixer};
use crate::error::AppError;
use crate::registry::{OutboundFrame, OutboundHandle};
use crate::speech::bridge::{SpeechInput, UpstreamBridge};
use crate::state::AppState;
use crate::telephony::envelope::{EnvelopeError, StreamStart, TelephonyEvent};

use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde_json::json;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Lifecycle of the call behind one media stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallLifecycle {
    /// Connected, start event not yet seen.
    Pending,
    /// Start seen; media is flowing.
    Active,
    /// Stop seen, or ingest shut down.
    Ended,
}

/// Identity and lifecycle of one call.
#[derive(Debug, Clone)]
pub struct CallSession {
    call_sid: Option<String>,
    stream_sid: Option<String>,
    lifecycle: CallLifecycle,
}

impl CallSession {
    fn new() -> Self {
        Self {
            call_sid: None,
            stream_sid: None,
            lifecycle: CallLifecycle::Pending,
        }
    }

    fn activate(&mut self, start: &StreamStart) {
        self.call_sid = Some(start.call_sid.clone());
        self.stream_sid = Some(start.stream_sid.clone());
        self.lifecycle = CallLifecycle::Active;
    }

    fn end(&mut self) {
        self.lifecycle = CallLifecycle::Ended;
    }

    pub fn call_sid(&self) -> Option<&str> {
        self.call_sid.as_deref()
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    pub fn lifecycle(&self) -> CallLifecycle {
        self.lifecycle
    }
}

/// What the caller should do after one message is consumed.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Nothing to do; keep reading.
    Continue,
    /// The start event arrived; the session identity is now known.
    Started(StreamStart),
    /// The stop event arrived; ingest is complete.
    Stopped,
}

/// Why ingest failed, when it did not end with a stop event.
#[derive(Debug)]
pub enum IngestError {
    /// The message failed the envelope parse.
    Malformed(EnvelopeError),
    /// The speech bridge dropped its end of the audio queue.
    UpstreamClosed,
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Malformed(err) => write!(f, "{}", err),
            IngestError::UpstreamClosed => write!(f, "Speech bridge queue is closed"),
        }
    }
}

/// Per-connection message pipeline: envelope in, mixed windows out.
///
/// Kept free of any transport type so the whole ingest path can be driven in
/// tests with plain strings and a channel.
pub struct CallPipeline {
    session: CallSession,
    mixer: TrackMixer,
    audio_tx: mpsc::UnboundedSender<SpeechInput>,
    windows_sent: u64,
}

impl CallPipeline {
    pub fn new(format: AudioFormat, audio_tx: mpsc::UnboundedSender<SpeechInput>) -> Self {
        Self {
            session: CallSession::new(),
            mixer: TrackMixer::new(format),
            audio_tx,
            windows_sent: 0,
        }
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn windows_sent(&self) -> u64 {
        self.windows_sent
    }

    /// Feed one transport text message through parse, fill and extraction.
    ///
    /// Every full window this frame completes is queued to the bridge before
    /// returning, in timeline order.
    pub fn handle_message(&mut self, raw: &str) -> Result<IngestOutcome, IngestError> {
        let event = TelephonyEvent::parse(raw).map_err(IngestError::Malformed)?;

        match event {
            TelephonyEvent::Connected => Ok(IngestOutcome::Continue),
            TelephonyEvent::Start(start) => {
                self.session.activate(&start);
                Ok(IngestOutcome::Started(start))
            }
            TelephonyEvent::Media(frame) => {
                self.mixer
                    .ingest(frame.track, frame.timestamp_ms, &frame.payload);
                while let Some(window) = self.mixer.try_extract_window() {
                    self.audio_tx
                        .send(SpeechInput::Window(window))
                        .map_err(|_| IngestError::UpstreamClosed)?;
                    self.windows_sent += 1;
                }
                Ok(IngestOutcome::Continue)
            }
            TelephonyEvent::Stop => {
                self.session.end();
                Ok(IngestOutcome::Stopped)
            }
        }
    }

    /// Mark the session over and queue the flush marker for the bridge.
    ///
    /// Safe to call when the bridge is already gone; the marker is simply
    /// dropped.
    pub fn finish(&mut self) {
        self.session.end();
        let inbound_left = self.mixer.buffered(Track::Inbound);
        let outbound_left = self.mixer.buffered(Track::Outbound);
        if inbound_left > 0 || outbound_left > 0 {
            debug!(
                inbound_left,
                outbound_left, "Discarding sub-window audio remainder"
            );
        }
        let _ = self.audio_tx.send(SpeechInput::Flush);
    }
}

/// WebSocket actor for one telephony media stream connection.
pub struct TelephonyWebSocket {
    state: web::Data<AppState>,
    pipeline: CallPipeline,
    /// Hands the call id to the bridge once the start event names it.
    call_sid_tx: Option<oneshot::Sender<String>>,
    /// Held until registration; the registry owns it afterwards.
    outbound_tx: Option<mpsc::UnboundedSender<OutboundFrame>>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundFrame>>,
    last_heartbeat: Instant,
}

impl TelephonyWebSocket {
    pub fn new(
        state: web::Data<AppState>,
        audio_tx: mpsc::UnboundedSender<SpeechInput>,
        call_sid_tx: oneshot::Sender<String>,
    ) -> Self {
        let format = state.get_config().audio;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            pipeline: CallPipeline::new(format, audio_tx),
            state,
            call_sid_tx: Some(call_sid_tx),
            outbound_tx: Some(outbound_tx),
            outbound_rx: Some(outbound_rx),
            last_heartbeat: Instant::now(),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(Duration::from_secs(30), |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > Duration::from_secs(60) {
                warn!(
                    call_sid = ?act.pipeline.session().call_sid(),
                    "Media stream heartbeat timeout, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_event(&mut self, raw: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match self.pipeline.handle_message(raw) {
            Ok(IngestOutcome::Continue) => {}
            Ok(IngestOutcome::Started(start)) => self.register_session(start, ctx),
            Ok(IngestOutcome::Stopped) => {
                info!(
                    call_sid = ?self.pipeline.session().call_sid(),
                    windows = self.pipeline.windows_sent(),
                    "Media stream stopped by provider"
                );
                ctx.stop();
            }
            Err(err @ IngestError::Malformed(_)) => {
                error!(
                    call_sid = ?self.pipeline.session().call_sid(),
                    error = %err,
                    "Malformed media stream message, closing connection"
                );
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Invalid,
                    description: Some("unparseable media stream message".to_string()),
                }));
                ctx.stop();
            }
            Err(err @ IngestError::UpstreamClosed) => {
                warn!(
                    call_sid = ?self.pipeline.session().call_sid(),
                    error = %err,
                    "Speech bridge gone, closing media stream"
                );
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Error,
                    description: Some("speech service unavailable".to_string()),
                }));
                ctx.stop();
            }
        }
    }

    fn register_session(&mut self, start: StreamStart, ctx: &mut ws::WebsocketContext<Self>) {
        let outbound_tx = match self.outbound_tx.take() {
            Some(tx) => tx,
            None => {
                // A repeated start event on a connection that already
                // registered; the first registration stands.
                debug!(call_sid = %start.call_sid, "Ignoring repeated start event");
                return;
            }
        };

        let handle = OutboundHandle {
            stream_sid: start.stream_sid.clone(),
            sender: outbound_tx,
        };
        if !self.state.registry().begin_session(&start.call_sid, handle) {
            // Another connection already owns this call. Closing without
            // revealing the call id to this connection's bridge keeps its
            // teardown away from the live session.
            warn!(
                call_sid = %start.call_sid,
                "Call already registered by another connection, closing"
            );
            ctx.close(Some(ws::CloseReason {
                code: ws::CloseCode::Policy,
                description: Some("call already has a live media stream".to_string()),
            }));
            ctx.stop();
            return;
        }

        if let Some(call_sid_tx) = self.call_sid_tx.take() {
            if call_sid_tx.send(start.call_sid.clone()).is_err() {
                warn!(call_sid = %start.call_sid, "Speech bridge exited before the start event");
            }
        }

        info!(
            call_sid = %start.call_sid,
            stream_sid = %start.stream_sid,
            "Media stream started"
        );
    }
}

impl Actor for TelephonyWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Telephony media stream connected");
        self.heartbeat(ctx);
        self.state.increment_active_calls();

        if let Some(outbound_rx) = self.outbound_rx.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound_rx));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Runs on every exit path, so the bridge always sees the flush
        // marker exactly once.
        self.pipeline.finish();
        self.state.decrement_active_calls();
        info!(
            call_sid = ?self.pipeline.session().call_sid(),
            stream_sid = ?self.pipeline.session().stream_sid(),
            lifecycle = ?self.pipeline.session().lifecycle(),
            windows = self.pipeline.windows_sent(),
            "Telephony media stream closed"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TelephonyWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_event(&text, ctx),
            Ok(ws::Message::Binary(bytes)) => {
                // The provider's protocol is text-only.
                warn!(bytes = bytes.len(), "Ignoring binary message on media stream");
            }
            Ok(ws::Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(?reason, "Media stream closed by provider");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Ignoring continuation frame on media stream");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(error = %e, "Media stream protocol error");
                ctx.stop();
            }
        }
    }
}

/// Synthesized media frames queued by the HTTP side for this connection.
impl StreamHandler<OutboundFrame> for TelephonyWebSocket {
    fn handle(&mut self, frame: OutboundFrame, ctx: &mut Self::Context) {
        ctx.text(frame.0);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // All senders are gone, meaning the registry entry was removed; the
        // call is over on the speech side.
        debug!(
            call_sid = ?self.pipeline.session().call_sid(),
            "Outbound media channel closed, stopping ingest"
        );
        ctx.stop();
    }
}

/// Entry point for the provider's media stream WebSocket.
///
/// The speech connection is opened before the WebSocket upgrade completes;
/// if the speech service is unreachable the provider gets a 502 instead of a
/// stream that goes nowhere.
pub async fn telephony_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let config = state.get_config();

    let active = state.active_call_count();
    if active >= config.limits.max_concurrent_calls {
        warn!(
            active,
            limit = config.limits.max_concurrent_calls,
            "Rejecting media stream: at call capacity"
        );
        return Ok(HttpResponse::ServiceUnavailable().json(json!({
            "error": {
                "type": "capacity_exhausted",
                "message": "Maximum concurrent calls reached",
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        })));
    }

    info!(
        peer = ?req.connection_info().peer_addr(),
        "Telephony media stream connecting"
    );

    let (audio_tx, audio_rx) = mpsc::unbounded_channel();
    let (call_sid_tx, call_sid_rx) = oneshot::channel();

    let bridge = match UpstreamBridge::connect(&config.speech, &config.audio).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!(error = %e, "Speech service connection failed, refusing media stream");
            return Err(AppError::Upstream(e.to_string()).into());
        }
    };
    bridge.spawn(
        audio_rx,
        call_sid_rx,
        state.registry().clone(),
        config.speech.flush_grace(),
    );

    ws::start(
        TelephonyWebSocket::new(state, audio_tx, call_sid_tx),
        &req,
        stream,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    const START: &str = r#"{
        "event": "start",
        "sequenceNumber": "1",
        "start": {"callSid": "CA5678", "streamSid": "MZ1234", "tracks": ["inbound", "outbound"]},
        "streamSid": "MZ1234"
    }"#;

    const STOP: &str =
        r#"{"event":"stop","sequenceNumber":"9","stop":{"callSid":"CA5678"},"streamSid":"MZ1234"}"#;

    fn media_json(track: &str, timestamp: u64, payload: &[u8]) -> String {
        format!(
            r#"{{"event":"media","media":{{"track":"{}","timestamp":"{}","payload":"{}"}},"streamSid":"MZ1234"}}"#,
            track,
            timestamp,
            BASE64.encode(payload)
        )
    }

    fn pipeline() -> (CallPipeline, mpsc::UnboundedReceiver<SpeechInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CallPipeline::new(AudioFormat::default(), tx), rx)
    }

    #[test]
    fn test_start_event_activates_session() {
        let (mut pipeline, _rx) = pipeline();

        let outcome = pipeline.handle_message(START).unwrap();
        assert!(matches!(outcome, IngestOutcome::Started(ref s) if s.call_sid == "CA5678"));
        assert_eq!(pipeline.session().call_sid(), Some("CA5678"));
        assert_eq!(pipeline.session().stream_sid(), Some("MZ1234"));
        assert_eq!(pipeline.session().lifecycle(), CallLifecycle::Active);
    }

    #[test]
    fn test_connected_event_changes_nothing() {
        let (mut pipeline, mut rx) = pipeline();

        let outcome = pipeline
            .handle_message(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#)
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Continue));
        assert_eq!(pipeline.session().lifecycle(), CallLifecycle::Pending);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_media_queues_windows_in_order() {
        let (mut pipeline, mut rx) = pipeline();
        let window = AudioFormat::default().window_bytes();
        pipeline.handle_message(START).unwrap();

        pipeline
            .handle_message(&media_json("inbound", 0, &vec![0x01; window]))
            .unwrap();
        assert!(rx.try_recv().is_err()); // outbound side still empty

        pipeline
            .handle_message(&media_json("outbound", 0, &vec![0x02; window]))
            .unwrap();
        // Timestamps advance by one frame, so no silence is inserted and the
        // window contents stay exactly what was sent.
        pipeline
            .handle_message(&media_json("inbound", 20, &vec![0x03; window]))
            .unwrap();
        pipeline
            .handle_message(&media_json("outbound", 20, &vec![0x04; window]))
            .unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        match (first, second) {
            (SpeechInput::Window(a), SpeechInput::Window(b)) => {
                assert_eq!(&a.bytes[..2], &[0x01, 0x02]);
                assert_eq!(&b.bytes[..2], &[0x03, 0x04]);
            }
            other => panic!("expected two windows, got {:?}", other),
        }
        assert_eq!(pipeline.windows_sent(), 2);
    }

    #[test]
    fn test_stop_completes_ingest() {
        let (mut pipeline, _rx) = pipeline();
        pipeline.handle_message(START).unwrap();

        let outcome = pipeline.handle_message(STOP).unwrap();
        assert!(matches!(outcome, IngestOutcome::Stopped));
        assert_eq!(pipeline.session().lifecycle(), CallLifecycle::Ended);
    }

    #[test]
    fn test_malformed_message_is_fatal() {
        let (mut pipeline, _rx) = pipeline();

        let err = pipeline.handle_message("{\"event\":\"mark\"}").unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));

        let err = pipeline.handle_message("garbage").unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));
    }

    #[test]
    fn test_closed_bridge_surfaces_as_upstream_error() {
        let (mut pipeline, rx) = pipeline();
        let window = AudioFormat::default().window_bytes();
        drop(rx);

        pipeline
            .handle_message(&media_json("inbound", 0, &vec![0x01; window]))
            .unwrap();
        let err = pipeline
            .handle_message(&media_json("outbound", 0, &vec![0x02; window]))
            .unwrap_err();
        assert!(matches!(err, IngestError::UpstreamClosed));
    }

    #[test]
    fn test_finish_queues_flush_marker() {
        let (mut pipeline, mut rx) = pipeline();
        pipeline.handle_message(START).unwrap();

        pipeline.finish();
        assert!(matches!(rx.try_recv().unwrap(), SpeechInput::Flush));
        assert_eq!(pipeline.session().lifecycle(), CallLifecycle::Ended);
    }
}
