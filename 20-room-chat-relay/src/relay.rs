use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{
    net::TcpListener,
    select,
    sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
        watch,
    },
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    message::{self, ChatMessage, ClientEvent, ConnectionId, RoomCode, ServerEvent},
    registry::{Delivery, RoomRegistry},
};

pub const DEFAULT_WS_PATH: &str = "/ws";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub path: String,
}

pub struct RelayServer {
    listener: TcpListener,
    path: String,
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            path: DEFAULT_WS_PATH.to_string(),
            state: Arc::new(RelayState::new()),
        }
    }

    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener).with_path(config.path.clone()))
    }

    /// Serves the WebSocket endpoint on `path` instead of [`DEFAULT_WS_PATH`].
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let RelayServer {
            listener,
            path,
            state,
        } = self;

        let app = router(Arc::clone(&state), &path);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                handle_shutdown(&state);
            })
            .await
            .context("relay server failed")?;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn router(state: Arc<RelayState>, path: &str) -> Router {
    // Any origin may connect; browsers and mobile webviews alike.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(path, get(upgrade))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

fn handle_shutdown(state: &RelayState) {
    info!("relay shutting down");
    state.shutdown.send_replace(true);
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Events queued for one connection before further deliveries are dropped.
pub(crate) const OUTBOX_CAPACITY: usize = 128;

type Outbox = mpsc::Sender<ServerEvent>;

pub(crate) struct RelayState {
    inner: Mutex<RelayInner>,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct RelayInner {
    registry: RoomRegistry,
    outboxes: HashMap<ConnectionId, Outbox>,
}

impl RelayInner {
    // Runs while the registry lock is held so no delivery races a membership change.
    fn dispatch(&self, deliveries: Vec<Delivery>) {
        for Delivery { to, event } in deliveries {
            match self.outboxes.get(&to) {
                Some(outbox) => match outbox.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        warn!(conn = %to, ?event, "connection is not keeping up; dropping event");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(conn = %to, "outbox closed; dropping event");
                    }
                },
                None => debug!(conn = %to, "no outbox for connection; dropping event"),
            }
        }
    }

    fn relay_to_room(&self, sender: &ConnectionId, room: &RoomCode, event: ServerEvent) {
        if !self.registry.is_member(sender, room) {
            debug!(conn = %sender, room = %room, "ignoring event for a room the connection has not joined");
            return;
        }
        self.dispatch(self.registry.broadcast_from(sender, room, event));
    }
}

impl RelayState {
    pub(crate) fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Mutex::new(RelayInner::default()),
            shutdown,
        }
    }

    pub(crate) async fn register(&self, conn: ConnectionId, outbox: Outbox) {
        let mut inner = self.inner.lock().await;
        inner.outboxes.insert(conn, outbox);
    }

    pub(crate) async fn handle_event(&self, conn: &ConnectionId, event: ClientEvent) {
        let mut inner = self.inner.lock().await;

        match event {
            ClientEvent::JoinRoom(room) => {
                if room.is_blank() {
                    debug!(conn = %conn, "ignoring join without a room code");
                    return;
                }
                let deliveries = inner.registry.join(conn, &room);
                info!(conn = %conn, room = %room, "joined room");
                inner.dispatch(deliveries);
            }
            ClientEvent::LeaveRoom(room) => {
                if room.is_blank() {
                    debug!(conn = %conn, "ignoring leave without a room code");
                    return;
                }
                let deliveries = inner.registry.leave(conn, &room);
                info!(conn = %conn, room = %room, "left room");
                inner.dispatch(deliveries);
            }
            ClientEvent::SendMessage(ChatMessage { room_code, text }) => {
                if text.trim().is_empty() {
                    debug!(conn = %conn, room = %room_code, "ignoring empty message");
                    return;
                }
                debug!(conn = %conn, room = %room_code, "relaying message");
                inner.relay_to_room(conn, &room_code, ServerEvent::ReceiveMessage(text));
            }
            ClientEvent::Typing(is_typing, _who, room) => {
                let event = if is_typing {
                    ServerEvent::UserTyping
                } else {
                    ServerEvent::UserNotTyping
                };
                inner.relay_to_room(conn, &room, event);
            }
            ClientEvent::StoppedTyping(room) => {
                inner.relay_to_room(conn, &room, ServerEvent::UserNotTyping);
            }
        }
    }

    /// Forgets a connection whose transport has closed.
    pub(crate) async fn disconnect(&self, conn: &ConnectionId) {
        let mut inner = self.inner.lock().await;
        inner.outboxes.remove(conn);
        let deliveries = inner.registry.disconnect(conn);
        inner.dispatch(deliveries);
    }
}

async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let conn = ConnectionId::generate();
    let (outbox, mut inbox) = mpsc::channel(OUTBOX_CAPACITY);
    state.register(conn.clone(), outbox).await;
    info!(conn = %conn, "client connected");

    let (mut sink, mut stream) = socket.split();
    let mut shutdown = state.shutdown.subscribe();
    let shutting_down = *shutdown.borrow_and_update();

    if !shutting_down {
        loop {
            select! {
                frame = stream.next() => {
                    if !handle_frame(frame, &state, &conn).await {
                        break;
                    }
                }
                outbound = inbox.recv() => {
                    let Some(event) = outbound else { break };
                    if let Err(err) = send_event(&mut sink, &event).await {
                        debug!(conn = %conn, error = ?err, "failed to deliver event");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    state.disconnect(&conn).await;
    info!(conn = %conn, "client disconnected");
}

async fn handle_frame(
    frame: Option<Result<Message, axum::Error>>,
    state: &RelayState,
    conn: &ConnectionId,
) -> bool {
    match frame {
        Some(Ok(Message::Text(text))) => {
            match message::decode::<ClientEvent>(&text) {
                Ok(event) => state.handle_event(conn, event).await,
                Err(err) => warn!(conn = %conn, error = %err, "dropping malformed frame"),
            }
            true
        }
        Some(Ok(Message::Close(_))) | None => false,
        Some(Ok(_)) => true,
        Some(Err(err)) => {
            debug!(conn = %conn, error = ?err, "transport error");
            false
        }
    }
}

async fn send_event(sink: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> Result<()> {
    let frame = message::encode(event)?;
    sink.send(Message::Text(frame)).await?;
    Ok(())
}
