use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use room_chat_relay::{
    client::{ChatClient, SessionConfig, SessionHandle},
    message::RoomCode,
    relay::RelayServer,
    session::{DisplayMessage, SessionState, SessionView},
    typing::DEFAULT_TYPING_WINDOW,
};
use tokio::{net::TcpListener, select, sync::oneshot, time::timeout};

const WAIT: Duration = Duration::from_secs(3);

async fn start_relay() -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = RelayServer::new(listener);
    let addr = server.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = server.run_until(shutdown).await;
    });

    Ok((addr, shutdown_tx))
}

fn config(addr: SocketAddr, code: &str) -> SessionConfig {
    SessionConfig {
        url: format!("ws://{addr}/ws"),
        room_code: RoomCode::new(code).expect("room code"),
        typing_window: DEFAULT_TYPING_WINDOW,
    }
}

async fn open(addr: SocketAddr, code: &str) -> Result<SessionHandle> {
    open_with(config(addr, code)).await
}

async fn open_with(config: SessionConfig) -> Result<SessionHandle> {
    let client = ChatClient::new(config);
    assert_eq!(client.session().state(), SessionState::Disconnected);
    client.connect().await
}

async fn wait_for<F>(handle: &SessionHandle, predicate: F) -> Result<SessionView>
where
    F: FnMut(&SessionView) -> bool,
{
    Ok(timeout(WAIT, handle.wait_for(predicate)).await??)
}

/// Resolves once one member has been told about the other. Only the member
/// already in the room gets `userJoined`, so whichever joined first reports
/// it; at that point the relay has applied both joins.
async fn wait_until_paired(a: &SessionHandle, b: &SessionHandle) -> Result<()> {
    let either = async {
        select! {
            seen = a.wait_for(|view| !view.peers.is_empty()) => seen.map(|_| ()),
            seen = b.wait_for(|view| !view.peers.is_empty()) => seen.map(|_| ()),
        }
    };
    timeout(WAIT, either).await??;
    Ok(())
}

#[tokio::test]
async fn sender_renders_locally_and_peer_receives() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let first = open(addr, "AB12CD").await?;
    let second = open(addr, "AB12CD").await?;
    wait_until_paired(&first, &second).await?;

    first.send("hello")?;

    let received = wait_for(&second, |view| !view.messages.is_empty()).await?;
    assert_eq!(received.messages, vec![DisplayMessage::other("hello")]);

    let sent = wait_for(&first, |view| !view.messages.is_empty()).await?;
    assert_eq!(sent.messages, vec![DisplayMessage::me("hello")]);

    first.leave().await?;
    second.leave().await?;
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn sessions_in_different_rooms_do_not_interact() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let x = open(addr, "X").await?;
    let y = open(addr, "Y").await?;
    let x_peer = open(addr, "X").await?;
    wait_until_paired(&x, &x_peer).await?;

    x.send("only for X")?;
    wait_for(&x_peer, |view| !view.messages.is_empty()).await?;

    let view = y.view();
    assert!(view.messages.is_empty());
    assert!(view.peers.is_empty());

    for handle in [x, y, x_peer] {
        handle.leave().await?;
    }
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn typing_is_shown_to_the_peer_until_a_message_is_sent() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let typist = open(addr, "T").await?;
    let reader = open(addr, "T").await?;
    wait_until_paired(&typist, &reader).await?;

    typist.input("h")?;
    wait_for(&reader, |view| view.peer_typing).await?;

    typist.input("hi")?;
    typist.submit()?;
    let view = wait_for(&reader, |view| !view.peer_typing && !view.messages.is_empty()).await?;
    assert_eq!(view.messages, vec![DisplayMessage::other("hi")]);

    typist.leave().await?;
    reader.leave().await?;
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn typing_stops_on_its_own_after_the_window() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let typist = open_with(SessionConfig {
        typing_window: Duration::from_millis(200),
        ..config(addr, "IDLE")
    })
    .await?;
    let reader = open(addr, "IDLE").await?;
    wait_until_paired(&typist, &reader).await?;

    let mut updates = reader.subscribe();
    typist.input("h")?;
    timeout(WAIT, updates.wait_for(|view| view.peer_typing)).await??;
    timeout(WAIT, updates.wait_for(|view| !view.peer_typing)).await??;

    assert!(reader.view().messages.is_empty());

    typist.leave().await?;
    reader.leave().await?;
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn leaving_is_seen_by_the_remaining_peer() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let stayer = open(addr, "L").await?;
    let leaver = open(addr, "L").await?;
    wait_until_paired(&stayer, &leaver).await?;
    wait_for(&stayer, |view| !view.peers.is_empty()).await?;

    let mut updates = leaver.subscribe();
    leaver.leave().await?;
    let last = updates.borrow_and_update().clone();
    assert_eq!(last.state, SessionState::Disconnected);
    assert!(last.messages.is_empty());
    assert!(!last.connection_lost);

    wait_for(&stayer, |view| view.peers.is_empty()).await?;

    stayer.leave().await?;
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn dropping_the_handle_still_leaves_the_room() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let stayer = open(addr, "D").await?;
    let dropped = open(addr, "D").await?;
    wait_until_paired(&stayer, &dropped).await?;
    wait_for(&stayer, |view| !view.peers.is_empty()).await?;

    drop(dropped);

    wait_for(&stayer, |view| view.peers.is_empty()).await?;

    stayer.leave().await?;
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn changing_room_rejoins_elsewhere() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let mover = open(addr, "FIRST").await?;
    let second_room = open(addr, "SECOND").await?;

    let mover = mover
        .change_room(RoomCode::new("SECOND").expect("room code"))
        .await?;
    assert_eq!(mover.room_code().as_str(), "SECOND");

    wait_until_paired(&mover, &second_room).await?;
    second_room.send("welcome")?;
    let view = wait_for(&mover, |view| !view.messages.is_empty()).await?;
    assert_eq!(view.messages, vec![DisplayMessage::other("welcome")]);

    mover.leave().await?;
    second_room.leave().await?;
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn relay_shutdown_is_surfaced_as_connection_lost() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let session = open(addr, "GONE").await?;

    let _ = shutdown.send(());

    let view = wait_for(&session, |view| view.connection_lost).await?;
    assert_eq!(view.state, SessionState::Disconnected);
    assert!(session.send("too late").is_err());
    Ok(())
}

#[tokio::test]
async fn connecting_to_nothing_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    assert!(open(addr, "NOPE").await.is_err());
}
