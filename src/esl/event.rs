//! Control socket frames
//!
//! Every frame the switch sends (command replies, API responses, events,
//! disconnect notices) is represented as an [`Event`]: an ordered list of
//! headers plus an optional body.

use std::fmt;

/// Content types the switch uses on its control socket
pub mod content_type {
    pub const AUTH_REQUEST: &str = "auth/request";
    pub const COMMAND_REPLY: &str = "command/reply";
    pub const API_RESPONSE: &str = "api/response";
    pub const EVENT_PLAIN: &str = "text/event-plain";
    pub const DISCONNECT_NOTICE: &str = "text/disconnect-notice";
}

/// A single frame received from the switch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style header append
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub(crate) fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub(crate) fn set_body(&mut self, body: Option<String>) {
        self.body = body;
    }

    /// Look up a header, ignoring ASCII case (`Unique-ID` == `Unique-Id`)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Header value or the empty string when absent
    pub fn get(&self, name: &str) -> &str {
        self.header(name).unwrap_or("")
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn content_type(&self) -> &str {
        self.get("Content-Type")
    }

    pub fn name(&self) -> &str {
        self.get("Event-Name")
    }

    pub fn subclass(&self) -> &str {
        self.get("Event-Subclass")
    }

    /// Replies are routed to the pending command, everything else is an event
    pub fn is_reply(&self) -> bool {
        matches!(
            self.content_type(),
            content_type::AUTH_REQUEST | content_type::COMMAND_REPLY | content_type::API_RESPONSE
        )
    }

    pub fn is_disconnect_notice(&self) -> bool {
        self.content_type() == content_type::DISCONNECT_NOTICE
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        if let Some(body) = &self.body {
            writeln!(f)?;
            write!(f, "{}", body)?;
        }
        Ok(())
    }
}
