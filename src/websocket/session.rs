use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use super::messages::{ClientMessage, ServerMessage};
use super::registry::{ConnectionId, RoomRegistry};
use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(40);

/// WebSocket connection handler
/// Registers the connection, then upgrades the HTTP request.
pub async fn websocket_route(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> std::result::Result<HttpResponse, Error> {
    let peer_addr = req
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let registry = state.registry.clone();
    let (id, outbound) = registry.register().await;
    info!("New WebSocket connection {} from {}", id, peer_addr);

    let response = ws::start(
        WebSocketSession::new(id, registry.clone(), outbound, peer_addr),
        &req,
        stream,
    );
    if response.is_err() {
        // handshake rejected, the actor never started
        registry.disconnect(id).await;
    }
    response
}

/// Text frame queued for this session by the room registry
pub struct Outbound(String);

/// One client connection. Outbound room broadcasts arrive through the
/// registry channel and are forwarded as text frames.
pub struct WebSocketSession {
    id: ConnectionId,
    registry: RoomRegistry,
    outbound: Option<UnboundedReceiver<String>>,
    peer_addr: String,
    last_heartbeat: Instant,
}

impl WebSocketSession {
    pub fn new(
        id: ConnectionId,
        registry: RoomRegistry,
        outbound: UnboundedReceiver<String>,
        peer_addr: String,
    ) -> Self {
        Self {
            id,
            registry,
            outbound: Some(outbound),
            peer_addr,
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut <Self as Actor>::Context) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::JoinRoom(room)) => self.join_room(room, ctx),
            Ok(ClientMessage::Ping) => self.send_server_message(ctx, ServerMessage::Pong),
            Ok(ClientMessage::Pong) => self.last_heartbeat = Instant::now(),
            Err(e) => {
                warn!("Failed to parse message from {}: {}", self.peer_addr, e);
                self.send_server_message(
                    ctx,
                    ServerMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    },
                );
            }
        }
    }

    /// Joins are applied before any further client frame is processed.
    fn join_room(&mut self, room: String, ctx: &mut <Self as Actor>::Context) {
        let registry = self.registry.clone();
        let id = self.id;

        async move {
            registry.join(id, &room).await;
            room
        }
        .into_actor(self)
        .map(|room, act, ctx| {
            info!("Socket {} joined room {}", act.id, room);
            act.send_server_message(ctx, ServerMessage::Joined { room });
        })
        .wait(ctx);
    }

    fn send_server_message(&self, ctx: &mut <Self as Actor>::Context, msg: ServerMessage) {
        match serde_json::to_string(&msg) {
            Ok(json_str) => ctx.text(json_str),
            Err(e) => error!("Failed to serialize server message: {}", e),
        }
    }

    fn start_heartbeat(&self, ctx: &mut <Self as Actor>::Context) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > HEARTBEAT_TIMEOUT {
                warn!("Heartbeat timeout for connection {}", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for WebSocketSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection established with {} (id: {})", self.peer_addr, self.id);

        if let Some(rx) = self.outbound.take() {
            ctx.add_stream(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|text| (Outbound(text), rx))
            }));
        }

        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Socket disconnected: {} ({})", self.id, self.peer_addr);
        let registry = self.registry.clone();
        let id = self.id;
        actix::spawn(async move {
            registry.disconnect(id).await;
        });
    }
}

impl StreamHandler<Outbound> for WebSocketSession {
    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }

    // Sender dropped by the registry; the socket itself may still be open.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl StreamHandler<std::result::Result<ws::Message, ws::ProtocolError>> for WebSocketSession {
    fn handle(&mut self, msg: std::result::Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(bin)) => {
                warn!("Received binary message from {} of {} bytes", self.peer_addr, bin.len());
                self.send_server_message(
                    ctx,
                    ServerMessage::Error {
                        message: "Binary messages are not supported".to_string(),
                    },
                );
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed from {}: {:?}", self.peer_addr, reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(item)) => {
                warn!("Dropping fragmented frame from {}: {:?}", self.peer_addr, item);
                self.send_server_message(
                    ctx,
                    ServerMessage::Error {
                        message: "Fragmented messages are not supported".to_string(),
                    },
                );
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!("Error handling WebSocket message from {}: {}", self.peer_addr, e);
                ctx.stop();
            }
        }
    }
}
