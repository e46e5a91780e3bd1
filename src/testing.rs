//! Test doubles: a scripted switch and an in-memory queue manager FIFO

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::esl::EslConnection;
use crate::hylafax::{FaxqError, NotifySink};

pub fn command_reply(text: &str) -> String {
    format!("Content-Type: command/reply\nReply-Text: {}\n\n", text)
}

pub fn api_response(body: &str) -> String {
    format!(
        "Content-Type: api/response\nContent-Length: {}\n\n{}",
        body.len(),
        body
    )
}

/// Reply to `connect` in outbound socket mode, carrying the channel data
pub fn connect_reply(headers: &[(&str, &str)]) -> String {
    let mut frame = String::from("Content-Type: command/reply\nReply-Text: +OK\n");
    for (name, value) in headers {
        frame.push_str(&format!(
            "{}: {}\n",
            name,
            utf8_percent_encode(value, NON_ALPHANUMERIC)
        ));
    }
    frame.push('\n');
    frame
}

pub fn plain_event(headers: &[(&str, &str)]) -> String {
    let mut body = String::new();
    for (name, value) in headers {
        body.push_str(&format!(
            "{}: {}\n",
            name,
            utf8_percent_encode(value, NON_ALPHANUMERIC)
        ));
    }
    body.push('\n');
    format!(
        "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
        body.len(),
        body
    )
}

pub fn disconnect_notice() -> String {
    let body = "Disconnected, goodbye.\n";
    format!(
        "Content-Type: text/disconnect-notice\nContent-Length: {}\n\n{}",
        body.len(),
        body
    )
}

#[derive(Clone)]
struct Rule {
    trigger: String,
    reply: String,
    then: Vec<String>,
}

/// Commands received by a [`FakeSwitch`], in arrival order
#[derive(Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<String>>>);

impl CommandLog {
    fn push(&self, command: String) {
        self.0.lock().unwrap().push(command);
    }

    pub fn commands(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }
}

/// Scripted control socket peer
///
/// Each command is answered by the first rule whose trigger it contains,
/// followed by that rule's extra frames. Unmatched commands get `+OK`.
#[derive(Clone, Default)]
pub struct FakeSwitch {
    rules: Vec<Rule>,
    hang_up_after: Option<String>,
}

impl FakeSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, trigger: &str, reply: String, then: Vec<String>) -> Self {
        self.rules.push(Rule {
            trigger: trigger.to_string(),
            reply,
            then,
        });
        self
    }

    /// Close the socket after answering the matching command
    pub fn hang_up_after(mut self, trigger: &str) -> Self {
        self.hang_up_after = Some(trigger.to_string());
        self
    }

    /// Connect a client over an in-memory pipe
    pub fn attach(self) -> (EslConnection, CommandLog) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let log = CommandLog::default();
        tokio::spawn(self.run(server, log.clone(), false));
        (EslConnection::from_stream(client, "fake-switch"), log)
    }

    /// Accept TCP clients the way the switch's inbound socket does
    pub async fn listen(self) -> (SocketAddr, CommandLog) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = CommandLog::default();
        let shared = log.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(self.clone().run(stream, shared.clone(), true));
            }
        });
        (addr, log)
    }

    /// Dial a listening gateway the way the switch does for incoming calls
    pub async fn connect(self, addr: SocketAddr) -> CommandLog {
        let stream = TcpStream::connect(addr).await.unwrap();
        let log = CommandLog::default();
        tokio::spawn(self.run(stream, log.clone(), false));
        log
    }

    fn respond(&self, command: &str) -> (String, bool) {
        let hang_up = self
            .hang_up_after
            .as_deref()
            .is_some_and(|trigger| command.contains(trigger));

        if let Some(rule) = self.rules.iter().find(|r| command.contains(&r.trigger)) {
            let mut out = rule.reply.clone();
            for frame in &rule.then {
                out.push_str(frame);
            }
            return (out, hang_up);
        }

        let reply = if command.starts_with("api ") {
            api_response("+OK\n")
        } else {
            command_reply("+OK")
        };
        (reply, hang_up)
    }

    async fn run<S>(self, mut stream: S, log: CommandLog, greet: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if greet
            && stream
                .write_all(b"Content-Type: auth/request\n\n")
                .await
                .is_err()
        {
            return;
        }

        let mut pending = String::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));

            while let Some(end) = pending.find("\n\n") {
                let command = pending[..end].to_string();
                pending.drain(..end + 2);

                log.push(command.clone());
                let (out, hang_up) = self.respond(&command);
                if stream.write_all(out.as_bytes()).await.is_err() {
                    return;
                }
                if hang_up {
                    let _ = stream.shutdown().await;
                    return;
                }
            }
        }
    }
}

/// Queue manager FIFO stand-in; every message is forwarded to the test
pub struct MemorySink {
    tx: mpsc::UnboundedSender<String>,
}

impl MemorySink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotifySink for MemorySink {
    async fn write(&mut self, message: &str) -> Result<(), FaxqError> {
        self.tx
            .send(message.to_string())
            .map_err(|_| FaxqError::Closed)
    }
}

/// Drain everything currently queued
pub fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}
