use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::esl::Event;
use crate::hylafax::SessionLog;

/// Hangup cause recorded when the switch omits one
pub const UNSPECIFIED_CAUSE: &str = "UNSPECIFIED";

/// Image resolution or pixel size, `XxY`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub x: u32,
    pub y: u32,
}

impl Resolution {
    pub fn parse(s: &str) -> Option<Self> {
        let (x, y) = s.split_once('x')?;
        Some(Self {
            x: x.trim().parse().ok()?,
            y: y.trim().parse().ok()?,
        })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// One transferred page as reported by the fax engine
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub page: u32,
    pub bad_rows: u32,
    pub longest_bad_row_run: u32,
    pub encoding_name: String,
    pub image_pixel_size: Option<Resolution>,
    pub file_pixel_size: Option<Resolution>,
    pub image_resolution: Option<Resolution>,
    pub file_resolution: Option<Resolution>,
    pub image_size: u32,
}

impl PageResult {
    /// Build from a page event; missing or unparsable fields keep their default
    pub fn from_event(page: u32, ev: &Event) -> Self {
        Self {
            page,
            bad_rows: parse_num(ev, "Fax-Bad-Rows"),
            longest_bad_row_run: parse_num(ev, "Fax-Longest-Bad-Row-Run"),
            encoding_name: ev.get("Fax-Encoding-Name").to_string(),
            image_pixel_size: Resolution::parse(ev.get("Fax-Image-Pixel-Size")),
            file_pixel_size: Resolution::parse(ev.get("Fax-File-Image-Pixel-Size")),
            image_resolution: Resolution::parse(ev.get("Fax-Image-Resolution")),
            file_resolution: Resolution::parse(ev.get("Fax-File-Image-Resolution")),
            image_size: parse_num(ev, "Fax-Image-Size"),
        }
    }
}

impl fmt::Display for PageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self
            .image_pixel_size
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        write!(
            f,
            "Image Size: {}, Compression: {}, Comp Size: {} bytes, Bad Rows: {}",
            size, self.encoding_name, self.image_size, self.bad_rows
        )
    }
}

/// Negotiation and transfer outcome of one call
///
/// Filled in from switch events by [`FaxResult::add_event`]. Once a hangup
/// has been recorded the result is terminal and further events are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaxResult {
    pub uuid: Uuid,
    #[serde(skip)]
    session_log: Option<SessionLog>,

    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,

    pub hangup_cause: String,

    pub total_pages: u32,
    pub transferred_pages: u32,
    pub ecm: bool,
    pub remote_id: String,
    /// Fax engine result code (not a HylaFAX code)
    pub result_code: i32,
    pub result_text: String,
    pub success: bool,
    pub transfer_rate: u32,
    pub negotiate_count: u32,

    pub page_results: Vec<PageResult>,
}

impl FaxResult {
    pub fn new(uuid: Uuid, session_log: Option<SessionLog>) -> Self {
        Self {
            uuid,
            session_log,
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.hangup_cause.is_empty()
    }

    pub fn total_bad_rows(&self) -> u32 {
        self.page_results.iter().map(|p| p.bad_rows).sum()
    }

    /// Call duration, zero if the call never became active
    pub fn duration(&self) -> chrono::Duration {
        match (self.start_ts, self.end_ts) {
            (Some(start), Some(end)) if end > start => end - start,
            _ => chrono::Duration::zero(),
        }
    }

    fn log(&self, message: impl fmt::Display) {
        match &self.session_log {
            Some(log) => log.log(message),
            None => tracing::debug!("{} {}", self.uuid, message),
        }
    }

    /// Merge one switch event into the result
    pub fn add_event(&mut self, ev: &Event) {
        if self.is_terminal() {
            return;
        }

        match ev.name() {
            "CHANNEL_CALLSTATE" => {
                let state = ev.get("Channel-Call-State");
                self.log(format!("Call state change: {}", state));
                match state {
                    "ACTIVE" => self.start_ts = Some(Utc::now()),
                    "HANGUP" => {
                        self.end_ts = Some(Utc::now());
                        self.hangup_cause = match ev.get("Hangup-Cause") {
                            "" => UNSPECIFIED_CAUSE.to_string(),
                            cause => cause.to_string(),
                        };
                    }
                    _ => {}
                }
            }
            "CUSTOM" => self.add_fax_event(ev),
            _ => {}
        }
    }

    /// Keeps the last known station id when the event omits it
    fn set_remote_id(&mut self, ev: &Event) {
        let remote_id = ev.get("Fax-Remote-Station-Id");
        if !remote_id.is_empty() {
            self.remote_id = remote_id.to_string();
        }
    }

    fn add_fax_event(&mut self, ev: &Event) {
        match ev.subclass() {
            "spandsp::rxfaxnegociateresult" | "spandsp::txfaxnegociateresult" => {
                self.negotiate_count += 1;
                if ev.get("Fax-Ecm-Used") == "on" {
                    self.ecm = true;
                }
                self.set_remote_id(ev);
                if let Ok(rate) = ev.get("Fax-Transfer-Rate").parse() {
                    self.transfer_rate = rate;
                }
                self.log(format!(
                    "Remote ID: \"{}\", Transfer Rate: {}, ECM={}",
                    self.remote_id, self.transfer_rate, self.ecm
                ));
            }
            subclass @ ("spandsp::rxfaxpageresult" | "spandsp::txfaxpageresult") => {
                self.transferred_pages = match ev.get("Fax-Document-Transferred-Pages").parse() {
                    Ok(pages) => pages,
                    Err(_) => self.transferred_pages + 1,
                };

                let page = PageResult::from_event(self.transferred_pages, ev);
                let action = if subclass.starts_with("spandsp::rx") {
                    "received"
                } else {
                    "sent"
                };
                self.log(format!("Page {} {}: {}", page.page, action, page));
                self.page_results.push(page);
            }
            "spandsp::rxfaxresult" | "spandsp::txfaxresult" => {
                if let Ok(total) = ev.get("Fax-Document-Total-Pages").parse() {
                    self.total_pages = total;
                }
                if let Ok(pages) = ev.get("Fax-Document-Transferred-Pages").parse() {
                    self.transferred_pages = pages;
                }
                if ev.get("Fax-Ecm-Used") == "on" {
                    self.ecm = true;
                }
                self.set_remote_id(ev);
                if let Ok(code) = ev.get("Fax-Result-Code").parse() {
                    self.result_code = code;
                }
                self.result_text = ev.get("Fax-Result-Text").to_string();
                if ev.get("Fax-Success") == "1" {
                    self.success = true;
                }
                if let Ok(rate) = ev.get("Fax-Transfer-Rate").parse() {
                    self.transfer_rate = rate;
                }
            }
            _ => {}
        }
    }
}

fn parse_num(ev: &Event, name: &str) -> u32 {
    ev.get(name).trim().parse().unwrap_or_default()
}
