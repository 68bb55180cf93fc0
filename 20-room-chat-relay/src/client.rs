use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{
    io::{self, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    message::{self, ClientEvent, RoomCode, ServerEvent},
    session::{ChatSession, Origin, SessionError, SessionView},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the relay, e.g. `ws://127.0.0.1:3000/ws`.
    pub url: String,
    pub room_code: RoomCode,
    pub typing_window: Duration,
}

/// A chat session that has been prepared but not opened yet.
pub struct ChatClient {
    config: SessionConfig,
    session: ChatSession,
}

impl ChatClient {
    pub fn new(config: SessionConfig) -> Self {
        let session = ChatSession::new(config.room_code.clone(), config.typing_window);
        Self { config, session }
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    /// Opens the transport, joins the room and hands the session to a driver task.
    ///
    /// The join is sent before this returns; the relay never acknowledges it.
    pub async fn connect(self) -> Result<SessionHandle> {
        let ChatClient {
            config,
            mut session,
        } = self;
        session.connect()?;

        let (socket, _) = connect_async(config.url.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", config.url))?;
        info!(url = %config.url, room = %config.room_code, "connected to relay");

        let (mut sink, stream) = socket.split();
        emit(&mut sink, session.on_connected()).await;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(session.view());
        let task = tokio::spawn(drive(session, sink, stream, command_rx, view_tx));

        Ok(SessionHandle {
            config,
            commands,
            view,
            task,
        })
    }
}

enum Command {
    Input(String),
    Submit,
    Send(String),
    Leave(oneshot::Sender<()>),
}

/// Handle to a running session.
///
/// Dropping the handle runs the same teardown as [`SessionHandle::leave`]:
/// the driver emits `leaveRoom`, closes the socket and discards room state.
pub struct SessionHandle {
    config: SessionConfig,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<SessionView>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn room_code(&self) -> &RoomCode {
        &self.config.room_code
    }

    /// Reports an edit of the input box; may emit a typing notification.
    pub fn input(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.command(Command::Input(text.into()))
    }

    pub fn submit(&self) -> Result<(), SessionError> {
        self.command(Command::Submit)
    }

    /// Sends `text` as a message without going through the input box.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.command(Command::Send(text.into()))
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Waits until the published view satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<SessionView, SessionError>
    where
        F: FnMut(&SessionView) -> bool,
    {
        let mut view = self.view.clone();
        let matched = view
            .wait_for(predicate)
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(SessionView::clone(&matched))
    }

    /// Leaves the room, closes the transport and waits for teardown.
    pub async fn leave(self) -> Result<()> {
        let SessionHandle { commands, task, .. } = self;
        let (done, ack) = oneshot::channel();
        if commands.send(Command::Leave(done)).is_ok() {
            let _ = ack.await;
        }
        task.await.context("session driver panicked")?;
        Ok(())
    }

    /// Switches to another room: full teardown, then a fresh connection.
    pub async fn change_room(self, room_code: RoomCode) -> Result<SessionHandle> {
        let config = SessionConfig {
            room_code,
            ..self.config.clone()
        };
        self.leave().await?;
        ChatClient::new(config).connect().await
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }
}

async fn drive(
    mut session: ChatSession,
    mut sink: WsSink,
    mut stream: futures_util::stream::SplitStream<WsStream>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    view: watch::Sender<SessionView>,
) {
    let mut leave_ack = None;
    let mut transport_lost = false;

    loop {
        let deadline = session.typing_deadline();
        select! {
            frame = stream.next() => {
                if !handle_frame(frame, &mut session) {
                    transport_lost = true;
                    break;
                }
            }
            command = commands.recv() => match command {
                Some(Command::Input(text)) => {
                    let events = session.input_changed(text, Instant::now());
                    emit(&mut sink, events).await;
                }
                Some(Command::Submit) => emit(&mut sink, session.submit()).await,
                Some(Command::Send(text)) => emit(&mut sink, session.send(text)).await,
                Some(Command::Leave(done)) => {
                    leave_ack = Some(done);
                    break;
                }
                None => break,
            },
            _ = typing_timer(deadline) => {
                emit(&mut sink, session.on_timer(Instant::now())).await;
            }
        }
        view.send_replace(session.view());
    }
    // Refuse further actions before the final view is published.
    commands.close();

    if transport_lost {
        warn!(room = %session.room_code(), "connection to relay lost");
        session.on_transport_lost();
    } else {
        emit(&mut sink, session.leave()).await;
        if let Err(err) = sink.close().await {
            debug!(error = ?err, "failed to close socket cleanly");
        }
        info!(room = %session.room_code(), "left room");
        session.on_closed();
    }
    view.send_replace(session.view());

    if let Some(done) = leave_ack {
        let _ = done.send(());
    }
}

fn handle_frame(
    frame: Option<Result<Message, tungstenite::Error>>,
    session: &mut ChatSession,
) -> bool {
    match frame {
        Some(Ok(Message::Text(text))) => {
            match message::decode::<ServerEvent>(&text) {
                Ok(event) => session.on_server_event(event),
                Err(err) => warn!(error = %err, "dropping malformed frame"),
            }
            true
        }
        Some(Ok(Message::Close(_))) | None => false,
        Some(Ok(_)) => true,
        Some(Err(err)) => {
            debug!(error = ?err, "transport error");
            false
        }
    }
}

async fn typing_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Fire-and-forget: events that cannot be written are dropped.
async fn emit(sink: &mut WsSink, events: Vec<ClientEvent>) {
    for event in events {
        let frame = match message::encode(&event) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode event");
                continue;
            }
        };
        if let Err(err) = sink.send(Message::Text(frame)).await {
            debug!(error = ?err, ?event, "dropping event; transport unavailable");
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut handle = ChatClient::new(args.session_config()?).connect().await?;
    announce_room(handle.room_code()).await?;

    let mut stdin = spawn_stdin_reader();
    let mut updates = handle.subscribe();
    let mut rendered = Rendered::default();

    loop {
        select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = updates.borrow_and_update().clone();
                rendered.render(&view).await?;
                if view.connection_lost {
                    write_stderr("!!! connection lost").await?;
                    return Ok(());
                }
            }
            line = stdin.recv() => {
                let Some(line) = line else { break };
                let line = line.context("failed to read stdin")?;
                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Leave => {
                        write_stdout("*** leaving room").await?;
                        break;
                    }
                    Input::ChangeRoom(room_code) => {
                        handle = handle.change_room(room_code).await?;
                        updates = handle.subscribe();
                        rendered = Rendered::default();
                        announce_room(handle.room_code()).await?;
                    }
                    Input::Message(text) => handle.send(text)?,
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    handle.leave().await
}

// A plain thread, so a read blocked on an idle terminal never holds up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<std::io::Result<String>> {
    let (lines, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            if lines.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Leave,
    ChangeRoom(RoomCode),
    Message(String),
}

fn parse_input(line: &str) -> Input {
    let text = line.trim_end();
    if text.trim().is_empty() {
        return Input::Empty;
    }
    if text.eq_ignore_ascii_case("/leave") || text.eq_ignore_ascii_case("/quit") {
        return Input::Leave;
    }
    if let Some(code) = text.strip_prefix("/room ") {
        if let Some(room_code) = RoomCode::new(code) {
            return Input::ChangeRoom(room_code);
        }
    }
    Input::Message(text.to_string())
}

/// What the terminal has already printed for the current room.
#[derive(Default)]
struct Rendered {
    messages: usize,
    peers: std::collections::BTreeSet<message::ConnectionId>,
    peer_typing: bool,
}

impl Rendered {
    async fn render(&mut self, view: &SessionView) -> io::Result<()> {
        for joined in view.peers.difference(&self.peers) {
            write_stdout(&format!("*** {joined} joined the room")).await?;
        }
        for left in self.peers.difference(&view.peers) {
            write_stdout(&format!("*** {left} left the room")).await?;
        }
        self.peers = view.peers.clone();

        // Our own lines are already on screen as typed input.
        for message in view.messages.iter().skip(self.messages) {
            if message.from == Origin::Other {
                write_stdout(&format!("<other> {}", message.text)).await?;
            }
        }
        self.messages = view.messages.len();

        if view.peer_typing && !self.peer_typing {
            write_stdout("*** other user is typing...").await?;
        }
        self.peer_typing = view.peer_typing;

        Ok(())
    }
}

async fn announce_room(room_code: &RoomCode) -> io::Result<()> {
    write_stdout(&format!("*** joined room {room_code}")).await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
