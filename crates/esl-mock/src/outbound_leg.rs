//! Mock FreeSWITCH call leg for outbound-mode tests.
//!
//! In outbound mode FreeSWITCH dials the application.  `MockOutboundLeg`
//! plays that part: it connects to the library's socket server, answers
//! the `connect` command with the A-leg channel headers, acks every other
//! command with `+OK`, and lets the test inject events on the socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::debug;
use uuid::Uuid;

/// Identity of the simulated A-leg.
#[derive(Debug, Clone)]
pub struct OutboundLegConfig {
    pub uuid: String,
    pub channel_name: String,
    pub caller_id_number: String,
    pub destination_number: String,
    /// Auto-acknowledge `sendmsg execute` with a `CHANNEL_EXECUTE_COMPLETE`
    /// event echoing the `Event-UUID`.
    pub auto_complete_executes: bool,
}

impl Default for OutboundLegConfig {
    fn default() -> Self {
        OutboundLegConfig {
            uuid: Uuid::new_v4().to_string(),
            channel_name: "sofia/internal/1000@10.10.10.23".to_owned(),
            caller_id_number: "1000".to_owned(),
            destination_number: "4001".to_owned(),
            auto_complete_executes: false,
        }
    }
}

struct LegState {
    config: OutboundLegConfig,
    commands: Mutex<Vec<String>>,
}

/// One simulated call leg connected to an outbound socket server.
pub struct MockOutboundLeg {
    state: Arc<LegState>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockOutboundLeg {
    /// Dial the outbound server at `addr` and start answering its commands.
    pub async fn dial(addr: &str, config: OutboundLegConfig) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (mut read_half, write_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));
        let state = Arc::new(LegState {
            config,
            commands: Mutex::new(Vec::new()),
        });

        let loop_state = state.clone();
        let loop_writer = writer.clone();
        let task = tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let command = loop {
                    if let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
                        let raw: Vec<u8> = buffer.drain(..pos + 2).collect();
                        let text = String::from_utf8_lossy(&raw).trim().to_string();
                        if text.is_empty() {
                            continue;
                        }
                        break Some(text);
                    }
                    match read_half.read(&mut chunk).await {
                        Ok(0) | Err(_) => break None,
                        Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                    }
                };
                let Some(command) = command else { break };
                loop_state.commands.lock().unwrap().push(command.clone());
                debug!(command = %command, "mock leg received command");
                if !answer(&command, &loop_state, &loop_writer).await {
                    break;
                }
            }
        });

        Ok(Self {
            state,
            writer,
            _task: task,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.state.config.uuid
    }

    /// Commands the outbound server has sent this leg so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Push a `text/event-plain` frame built from `body` to the server.
    pub async fn send_event(&self, body: &str) -> std::io::Result<()> {
        let frame = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
            body.len(),
            body
        );
        let mut w = self.writer.lock().await;
        w.write_all(frame.as_bytes()).await?;
        w.flush().await
    }

    /// Push a `text/disconnect-notice`, as FreeSWITCH does on hangup.
    pub async fn send_disconnect(&self) -> std::io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(b"Content-Type: text/disconnect-notice\nContent-Length: 21\n\nDisconnected, goodbye")
            .await?;
        w.flush().await
    }

    /// Wait until a command starting with `prefix` arrives; `None` on timeout.
    pub async fn wait_for_command(&self, prefix: &str, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(cmd) = self
                .state
                .commands
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.starts_with(prefix))
            {
                return Some(cmd.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Answer one server command; returns false when the socket should close.
async fn answer(
    command: &str,
    state: &Arc<LegState>,
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
) -> bool {
    let cfg = &state.config;

    if command == "connect" {
        // The connect reply carries the full channel context of the A-leg.
        let reply = format!(
            "Content-Type: command/reply\n\
             Reply-Text: +OK\n\
             Event-Name: CHANNEL_DATA\n\
             Unique-ID: {uuid}\n\
             Channel-Unique-ID: {uuid}\n\
             Channel-State: CS_EXECUTE\n\
             Channel-State-Number: 4\n\
             Channel-Call-State: ACTIVE\n\
             Channel-Name: {name}\n\
             Caller-Caller-ID-Number: {cid}\n\
             Caller-Unique-ID: {uuid}\n\
             Caller-Destination-Number: {dest}\n\n",
            uuid = cfg.uuid,
            name = cfg.channel_name,
            cid = cfg.caller_id_number,
            dest = cfg.destination_number,
        );
        return write_raw(writer, &reply).await.is_ok();
    }

    if command.starts_with("sendmsg") {
        if write_raw(
            writer,
            "Content-Type: command/reply\nReply-Text: +OK\n\n",
        )
        .await
        .is_err()
        {
            return false;
        }
        if cfg.auto_complete_executes {
            if let Some(app_uuid) = command
                .lines()
                .find_map(|l| l.strip_prefix("Event-UUID: "))
            {
                let app = command
                    .lines()
                    .find_map(|l| l.strip_prefix("execute-app-name: "))
                    .unwrap_or("unknown");
                let body = format!(
                    "Event-Name: CHANNEL_EXECUTE_COMPLETE\n\
                     Unique-ID: {uuid}\n\
                     Application: {app}\n\
                     Application-UUID: {app_uuid}\n\
                     Application-Response: _none_\n",
                    uuid = cfg.uuid,
                );
                let frame = format!(
                    "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
                    body.len(),
                    body
                );
                return write_raw(writer, &frame).await.is_ok();
            }
        }
        return true;
    }

    if command.starts_with("bgapi") {
        // Echo the client's Job-UUID header, as FreeSWITCH does.
        let job_uuid = command
            .lines()
            .find_map(|l| l.strip_prefix("Job-UUID: "))
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
        return write_raw(
            writer,
            &format!("Content-Type: command/reply\nReply-Text: +OK Job-UUID: {job_uuid}\n\n"),
        )
        .await
        .is_ok();
    }

    if command == "exit" {
        let _ = write_raw(writer, "Content-Type: command/reply\nReply-Text: +OK bye\n\n").await;
        return false;
    }

    // linger / myevents / event plain ... / filter ...
    write_raw(writer, "Content-Type: command/reply\nReply-Text: +OK\n\n")
        .await
        .is_ok()
}

async fn write_raw(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    frame: &str,
) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(frame.as_bytes()).await?;
    w.flush().await
}
