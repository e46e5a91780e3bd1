//! A single control socket connection
//!
//! One reader task owns the read half. Command replies are forwarded, in
//! order, to whoever is waiting in [`EslConnection::send`]; every other frame
//! goes to the [`EventStream`], together with a single terminal error once the
//! socket fails or closes.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::EslCodec;
use super::event::{content_type, Event};
use super::EslError;

/// Must be `Sync`: spawned sessions hold `&EslConnection` across awaits
type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Events and the terminal error of one connection
pub struct EventStream {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub errors: oneshot::Receiver<EslError>,
}

pub struct EslConnection {
    writer: FramedWrite<BoxedWriter, EslCodec>,
    replies: mpsc::UnboundedReceiver<Event>,
    event_stream: Option<EventStream>,
    reader: JoinHandle<()>,
    peer: String,
}

impl EslConnection {
    /// Connect and authenticate to the switch's inbound socket
    pub async fn dial<A>(addr: A, password: &str) -> Result<Self, EslError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let peer = addr.to_string();
        let stream = TcpStream::connect(addr).await?;
        let mut conn = Self::from_stream(stream, peer);

        let greeting = conn.next_reply().await?;
        if greeting.content_type() != content_type::AUTH_REQUEST {
            return Err(EslError::UnexpectedReply(format!(
                "expected {}, got {}",
                content_type::AUTH_REQUEST,
                greeting.content_type()
            )));
        }

        match conn.send(&format!("auth {}", password)).await {
            Ok(_) => {}
            Err(EslError::CommandFailed(reason)) => return Err(EslError::AuthFailed(reason)),
            Err(e) => return Err(e),
        }

        tracing::debug!("Authenticated to event socket {}", conn.peer);
        Ok(conn)
    }

    /// Wrap a connection the switch made to our listener
    pub fn accept(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self::from_stream(stream, peer)
    }

    /// Wrap any bidirectional byte stream
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: BoxedWriter = Box::new(write_half);

        let (reply_tx, replies) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (error_tx, errors) = oneshot::channel();

        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, EslCodec::new());
            let terminal = loop {
                match frames.next().await {
                    Some(Ok(frame)) if frame.is_reply() => {
                        if reply_tx.send(frame).is_err() {
                            break EslError::ConnectionClosed;
                        }
                    }
                    Some(Ok(frame)) => {
                        // Nobody listening for events is not an error
                        let _ = event_tx.send(frame);
                    }
                    Some(Err(e)) => break e,
                    None => break EslError::ConnectionClosed,
                }
            };
            let _ = error_tx.send(terminal);
        });

        Self {
            writer: FramedWrite::new(writer, EslCodec::new()),
            replies,
            event_stream: Some(EventStream { events, errors }),
            reader,
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Take the event feed (can only be taken once)
    pub fn take_event_stream(&mut self) -> Option<EventStream> {
        self.event_stream.take()
    }

    async fn next_reply(&mut self) -> Result<Event, EslError> {
        self.replies.recv().await.ok_or(EslError::ConnectionClosed)
    }

    /// Send a raw command and wait for its reply
    pub async fn send(&mut self, command: &str) -> Result<Event, EslError> {
        self.writer.send(command).await?;
        let reply = self.next_reply().await?;
        check_reply(reply)
    }

    /// Run an API command and return its body
    pub async fn api(&mut self, command: &str) -> Result<String, EslError> {
        let reply = self.send(&format!("api {}", command)).await?;
        Ok(reply.body().unwrap_or_default().to_string())
    }

    /// Execute a dialplan application on the connected channel and wait for it
    pub async fn execute(&mut self, app: &str, arg: &str) -> Result<Event, EslError> {
        let mut command = format!(
            "sendmsg\ncall-command: execute\nexecute-app-name: {}\n",
            app
        );
        if !arg.is_empty() {
            command.push_str(&format!("execute-app-arg: {}\n", arg));
        }
        command.push_str("event-lock: true");
        self.send(&command).await
    }

    /// Close the write half and stop reading
    pub async fn close(&mut self) {
        if let Err(e) = self.writer.close().await {
            tracing::debug!("Closing event socket {}: {}", self.peer, e);
        }
        self.reader.abort();
    }
}

impl Drop for EslConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Turn `-ERR` replies into errors
fn check_reply(reply: Event) -> Result<Event, EslError> {
    if let Some(rest) = reply.get("Reply-Text").strip_prefix("-ERR") {
        return Err(EslError::CommandFailed(rest.trim().to_string()));
    }
    if reply.content_type() == content_type::API_RESPONSE {
        if let Some(rest) = reply.body().and_then(|body| body.strip_prefix("-ERR")) {
            return Err(EslError::CommandFailed(rest.trim().to_string()));
        }
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{api_response, command_reply, plain_event, FakeSwitch};

    #[tokio::test]
    async fn test_send_routes_replies_and_events_separately() {
        let switch = FakeSwitch::new().on(
            "connect",
            command_reply("+OK"),
            vec![plain_event(&[("Event-Name", "CHANNEL_CALLSTATE"), ("Channel-Call-State", "ACTIVE")])],
        );
        let (mut conn, _log) = switch.attach();

        let reply = conn.send("connect").await.unwrap();
        assert_eq!(reply.get("Reply-Text"), "+OK");

        let mut stream = conn.take_event_stream().unwrap();
        let ev = stream.events.recv().await.unwrap();
        assert_eq!(ev.get("Channel-Call-State"), "ACTIVE");
        assert!(conn.take_event_stream().is_none());
    }

    #[tokio::test]
    async fn test_api_error_becomes_command_failed() {
        let switch = FakeSwitch::new().on(
            "api originate",
            api_response("-ERR NO_ROUTE_DESTINATION\n"),
            vec![],
        );
        let (mut conn, _log) = switch.attach();

        match conn.api("originate {}sofia/gateway/gw/123, &txfax(/tmp/x.tif)").await {
            Err(EslError::CommandFailed(cause)) => assert_eq!(cause, "NO_ROUTE_DESTINATION"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_execute_formats_sendmsg() {
        let (mut conn, log) = FakeSwitch::new().attach();

        conn.execute("answer", "").await.unwrap();
        conn.execute("rxfax", "/var/spool/hylafax/recvq/fax00000001.tif").await.unwrap();

        let commands = log.commands();
        assert_eq!(
            commands[0],
            "sendmsg\ncall-command: execute\nexecute-app-name: answer\nevent-lock: true"
        );
        assert!(commands[1].contains("execute-app-arg: /var/spool/hylafax/recvq/fax00000001.tif\n"));
    }

    #[tokio::test]
    async fn test_closed_socket_reports_error_once() {
        let (mut conn, _log) = FakeSwitch::new().hang_up_after("linger").attach();
        let mut stream = conn.take_event_stream().unwrap();

        conn.send("linger").await.unwrap();

        let err = stream.errors.await.unwrap();
        assert!(matches!(err, EslError::ConnectionClosed));
        assert!(matches!(conn.send("event plain ALL").await, Err(_)));
    }

    #[tokio::test]
    async fn test_dial_authenticates() {
        let (addr, log) = FakeSwitch::new().listen().await;

        let mut conn = EslConnection::dial(addr, "ClueCon").await.unwrap();
        conn.api("db exists/fallback/123").await.unwrap();

        assert_eq!(log.commands()[0], "auth ClueCon");
    }

    #[tokio::test]
    async fn test_dial_rejected_password() {
        let switch = FakeSwitch::new().on("auth", command_reply("-ERR invalid"), vec![]);
        let (addr, _log) = switch.listen().await;

        let result = EslConnection::dial(addr, "wrong").await;
        assert!(matches!(result, Err(EslError::AuthFailed(reason)) if reason == "invalid"));
    }
}
