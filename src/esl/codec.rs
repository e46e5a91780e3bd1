//! Control socket framing
//!
//! Frames are a block of `Name: value` lines terminated by an empty line,
//! optionally followed by a body of `Content-Length` bytes. Plain events carry
//! a second, URL-encoded header block (and possibly a nested body) inside the
//! outer body; the decoder unwraps those so callers only see the event itself.

use bytes::{Buf, BytesMut};
use percent_encoding::percent_decode_str;
use tokio_util::codec::{Decoder, Encoder};

use super::event::{content_type, Event};
use super::EslError;

/// Frames larger than this are treated as a protocol error
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Decoder for switch frames and encoder for outgoing commands
#[derive(Debug, Default, Clone, Copy)]
pub struct EslCodec;

impl EslCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EslCodec {
    type Item = Event;
    type Error = EslError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Event>, EslError> {
        // Stray separators between frames
        while src.first().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            src.advance(1);
        }

        let Some(header_end) = find_blank_line(src) else {
            if src.len() > MAX_FRAME_LEN {
                return Err(EslError::Protocol("header block too large".to_string()));
            }
            return Ok(None);
        };

        let header_text = String::from_utf8_lossy(&src[..header_end]).into_owned();
        let mut frame = parse_headers(&header_text);
        let body_start = header_end + 2;

        let content_length = match frame.header("Content-Length") {
            Some(len) => len
                .trim()
                .parse::<usize>()
                .map_err(|_| EslError::Protocol(format!("invalid Content-Length: {}", len)))?,
            None => 0,
        };
        if content_length > MAX_FRAME_LEN {
            return Err(EslError::Protocol(format!(
                "frame body too large: {} bytes",
                content_length
            )));
        }

        if src.len() < body_start + content_length {
            src.reserve(body_start + content_length - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(body_start + content_length);
        raw.advance(body_start);

        if content_length > 0 {
            let body = String::from_utf8_lossy(&raw).into_owned();
            if frame.content_type() == content_type::EVENT_PLAIN {
                return Ok(Some(parse_plain_event(&body)));
            }
            frame.set_body(Some(body));
        }

        Ok(Some(frame))
    }
}

impl Encoder<&str> for EslCodec {
    type Error = EslError;

    /// Commands are terminated by an empty line
    fn encode(&mut self, command: &str, dst: &mut BytesMut) -> Result<(), EslError> {
        dst.reserve(command.len() + 2);
        dst.extend_from_slice(command.trim_end_matches('\n').as_bytes());
        dst.extend_from_slice(b"\n\n");
        Ok(())
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Parse a header block, URL-decoding values
fn parse_headers(text: &str) -> Event {
    let mut event = Event::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some((name, value)) = line.split_once(':') {
            let value = percent_decode_str(value.trim()).decode_utf8_lossy();
            event.push_header(name.trim(), value.into_owned());
        }
    }
    event
}

/// Parse the body of a `text/event-plain` frame into the event it carries
fn parse_plain_event(body: &str) -> Event {
    let (header_text, rest) = match body.find("\n\n") {
        Some(pos) => (&body[..pos], &body[pos + 2..]),
        None => (body, ""),
    };

    let mut event = parse_headers(header_text);
    let nested_len = event
        .header("Content-Length")
        .and_then(|len| len.trim().parse::<usize>().ok());

    if let Some(len) = nested_len {
        let end = len.min(rest.len());
        // Fall back to the whole remainder if the length splits a character
        let nested = rest.get(..end).unwrap_or(rest);
        event.set_body(Some(nested.to_string()));
    }

    event
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<Event> {
        let mut codec = EslCodec::new();
        let mut buf = BytesMut::from(input.as_bytes());
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_command_reply() {
        let frames = decode_all("Content-Type: command/reply\nReply-Text: +OK accepted\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].content_type(), "command/reply");
        assert_eq!(frames[0].get("Reply-Text"), "+OK accepted");
        assert!(frames[0].body().is_none());
    }

    #[test]
    fn test_decode_api_response_body() {
        let frames = decode_all(
            "Content-Type: api/response\nContent-Length: 26\n\n-ERR NO_ROUTE_DESTINATION\n",
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body(), Some("-ERR NO_ROUTE_DESTINATION\n"));
    }

    #[test]
    fn test_decode_plain_event_unwraps_and_decodes() {
        let body = "Event-Name: CHANNEL_CALLSTATE\nChannel-Call-State: HANGUP\nHangup-Cause: NORMAL_CLEARING\nCaller-Caller-ID-Name: John%20Doe\n\n";
        let frame = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
            body.len(),
            body
        );

        let frames = decode_all(&frame);
        assert_eq!(frames.len(), 1);
        let ev = &frames[0];
        assert_eq!(ev.name(), "CHANNEL_CALLSTATE");
        assert_eq!(ev.get("Hangup-Cause"), "NORMAL_CLEARING");
        assert_eq!(ev.get("Caller-Caller-ID-Name"), "John Doe");
        assert!(!ev.is_reply());
    }

    #[test]
    fn test_decode_plain_event_with_nested_body() {
        let body = "Event-Name: CUSTOM\nContent-Length: 5\n\nhello";
        let frame = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
            body.len(),
            body
        );

        let frames = decode_all(&frame);
        assert_eq!(frames[0].body(), Some("hello"));
    }

    #[test]
    fn test_decode_waits_for_complete_body() {
        let mut codec = EslCodec::new();
        let mut buf = BytesMut::from(&b"Content-Type: api/response\nContent-Length: 10\n\n+OK"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b" done\n\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.body(), Some("+OK done\n\n"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple_frames_in_one_buffer() {
        let frames = decode_all(
            "Content-Type: auth/request\n\nContent-Type: command/reply\nReply-Text: +OK\n\nContent-Type: text/disconnect-notice\nContent-Length: 3\n\nbye",
        );
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].content_type(), "auth/request");
        assert_eq!(frames[1].get("Reply-Text"), "+OK");
        assert!(frames[2].is_disconnect_notice());
    }

    #[test]
    fn test_decode_rejects_bad_content_length() {
        let mut codec = EslCodec::new();
        let mut buf = BytesMut::from(&b"Content-Type: api/response\nContent-Length: abc\n\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(EslError::Protocol(_))));
    }

    #[test]
    fn test_encode_appends_blank_line() {
        let mut codec = EslCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("api uuid_kill 1234", &mut buf).unwrap();
        assert_eq!(&buf[..], b"api uuid_kill 1234\n\n");
    }
}
