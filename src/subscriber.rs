//! # Subscriber WebSocket
//!
//! Client-facing connections that watch one call's speech results. On
//! connect the client receives the list of active call identifiers, answers
//! with the one it wants, and from then on gets every result payload for
//! that call verbatim until the call ends or it disconnects.

use crate::registry::SubscriberEvent;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket actor for one subscriber connection.
pub struct SubscriberWebSocket {
    state: web::Data<AppState>,
    /// Set once the client has picked a call.
    subscription: Option<(String, Uuid)>,
    last_heartbeat: Instant,
}

impl SubscriberWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            subscription: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(Duration::from_secs(30), |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > Duration::from_secs(60) {
                warn!("Subscriber heartbeat timeout, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Attach this connection to the call the client named.
    fn select_call(&mut self, call_sid: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.state.registry().subscribe(call_sid, tx) {
            Ok(subscriber_id) => {
                self.subscription = Some((call_sid.to_string(), subscriber_id));
                self.state.increment_active_subscribers();
                ctx.add_stream(UnboundedReceiverStream::new(rx));
                info!(
                    call_sid = %call_sid,
                    subscriber_id = %subscriber_id,
                    "Subscriber watching call"
                );
            }
            Err(err) => {
                warn!(call_sid = %call_sid, error = %err, "Rejecting subscriber");
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some(format!("no active call '{}'", call_sid)),
                }));
                ctx.stop();
            }
        }
    }
}

impl Actor for SubscriberWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Subscriber connected");
        self.heartbeat(ctx);

        // Greet with the calls available right now; the client answers with
        // the one it wants.
        let calls = self.state.registry().active_calls();
        if let Ok(json) = serde_json::to_string(&calls) {
            ctx.text(json);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some((call_sid, subscriber_id)) = self.subscription.take() {
            self.state.registry().unsubscribe(&call_sid, subscriber_id);
            self.state.decrement_active_subscribers();
            info!(call_sid = %call_sid, "Subscriber disconnected");
        } else {
            info!("Subscriber disconnected before selecting a call");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SubscriberWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                if self.subscription.is_none() {
                    self.select_call(text.trim(), ctx);
                } else {
                    debug!("Ignoring message from an already-subscribed client");
                }
            }
            Ok(ws::Message::Binary(_)) => {
                warn!("Ignoring binary message from subscriber");
            }
            Ok(ws::Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "Subscriber closed the connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Ignoring continuation frame from subscriber");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(error = %e, "Subscriber protocol error");
                ctx.stop();
            }
        }
    }
}

/// Events fanned out by the registry for the selected call.
impl StreamHandler<SubscriberEvent> for SubscriberWebSocket {
    fn handle(&mut self, event: SubscriberEvent, ctx: &mut Self::Context) {
        match event {
            SubscriberEvent::Result(payload) => ctx.text(payload),
            SubscriberEvent::SessionClosed => {
                info!("Watched call ended, closing subscriber");
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Normal,
                    description: Some("call ended".to_string()),
                }));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // The sink was pruned without a sentinel; nothing more will arrive.
        debug!("Subscriber event stream ended");
        ctx.stop();
    }
}

/// Entry point for subscriber WebSocket connections.
pub async fn subscriber_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        "Subscriber connecting"
    );
    ws::start(SubscriberWebSocket::new(state), &req, stream)
}
