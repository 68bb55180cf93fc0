use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const ROOM: &str = "AB12CD";

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("room_chat_relay");

    let (mut server_child, mut server_logs) = spawn_server(&binary)?;
    let banner = next_line(&mut server_logs, "relay banner").await?;
    let addr = banner
        .split_whitespace()
        .last()
        .filter(|addr| addr.contains(':'))
        .with_context(|| format!("relay banner missing socket: {banner}"))?;
    let url = format!("ws://{addr}/ws");

    // Keep consuming relay logs so the pipe never fills.
    let server_log_task =
        tokio::spawn(async move { while let Ok(Some(_)) = server_logs.next_line().await {} });

    let mut alice = ClientProcess::spawn(&binary, &url).await?;
    let mut bob = ClientProcess::spawn(&binary, &url).await?;

    // Alice was in the room first, so she is told about Bob.
    let alice_sees_bob = next_line(&mut alice.stdout, "join notice for alice").await?;
    assert!(
        alice_sees_bob.starts_with("*** ") && alice_sees_bob.ends_with(" joined the room"),
        "unexpected join notice: {alice_sees_bob}"
    );

    // Alice's message reaches Bob; Alice gets no echo.
    alice
        .send_line("Hello from Alice")
        .await
        .context("alice send line")?;
    let bob_hears_alice = next_line(&mut bob.stdout, "alice's message").await?;
    assert_eq!(bob_hears_alice, "<other> Hello from Alice");

    bob.send_line("Hi Alice!").await.context("bob send line")?;
    let alice_hears_bob = next_line(&mut alice.stdout, "bob's reply").await?;
    assert_eq!(alice_hears_bob, "<other> Hi Alice!");

    // Alice leaves; Bob receives the departure notification.
    alice.send_line("/leave").await.context("alice send leave")?;
    let alice_leave = next_line(&mut alice.stdout, "alice leaving").await?;
    assert_eq!(alice_leave, "*** leaving room");
    let bob_sees_departure = next_line(&mut bob.stdout, "departure notice for bob").await?;
    assert!(
        bob_sees_departure.starts_with("*** ") && bob_sees_departure.ends_with(" left the room"),
        "unexpected departure notice: {bob_sees_departure}"
    );

    bob.send_line("/quit").await.context("bob send quit")?;
    let bob_leave = next_line(&mut bob.stdout, "bob leaving").await?;
    assert_eq!(bob_leave, "*** leaving room");

    alice.exits_cleanly("alice").await?;
    bob.exits_cleanly("bob").await?;

    // The relay stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

type LineReader = Lines<BufReader<ChildStdout>>;

/// A terminal client joined to `ROOM`, driven through its stdin.
struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: LineReader,
}

impl ClientProcess {
    async fn spawn(binary: &Path, url: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["client", "--server", url, "--room", ROOM])
            .env("RUST_LOG", "warn")
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn client")?;
        let stdin = child.stdin.take().context("client stdin not piped")?;
        let stdout = child.stdout.take().context("client stdout not piped")?;

        let mut process = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };
        let banner = next_line(&mut process.stdout, "room banner").await?;
        if banner != format!("*** joined room {ROOM}") {
            return Err(anyhow!("expected room banner, got '{banner}'"));
        }
        Ok(process)
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn exits_cleanly(&mut self, name: &str) -> Result<()> {
        let status = self.child.wait().await?;
        if !status.success() {
            return Err(anyhow!("{name} exited with status {status}"));
        }
        Ok(())
    }
}

fn spawn_server(binary: &Path) -> Result<(Child, LineReader)> {
    let mut child = Command::new(binary)
        .args(["server", "--listen", "127.0.0.1:0"])
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn relay")?;
    let stdout = child.stdout.take().context("relay stdout not piped")?;
    Ok((child, BufReader::new(stdout).lines()))
}

async fn next_line(reader: &mut LineReader, what: &str) -> Result<String> {
    let line = timeout(READ_TIMEOUT, reader.next_line())
        .await
        .map_err(|_| anyhow!("timed out waiting for {what}"))?
        .with_context(|| format!("failed to read {what}"))?
        .ok_or_else(|| anyhow!("stream closed while waiting for {what}"))?;
    Ok(line.trim_end_matches('\r').to_string())
}
