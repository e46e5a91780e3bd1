//! Transmission log records (`etc/xferfaxlog`)
//!
//! One line per call with 19 tab-separated fields, as expected by HylaFAX
//! accounting tools. SEND lines describe outbound jobs, RECV lines received
//! documents.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Local, Utc};

use super::spool::{append_line, run_blocking};
use crate::models::FaxResult;

const TS_FORMAT: &str = "%m/%d/%y %H:%M";

#[derive(Debug, Clone, Default)]
pub struct XferRecord {
    pub ts: Option<DateTime<Utc>>,
    pub commid: String,
    pub modem: String,
    pub jobid: u32,
    pub jobtag: String,
    pub filename: String,
    pub sender: String,
    pub destnum: String,
    pub remote_id: String,
    pub params: u32,
    pub pages: u32,
    pub jobtime: Duration,
    pub conntime: Duration,
    pub reason: String,
    pub cidname: String,
    pub cidnum: String,
    pub owner: String,
    pub dcs: String,
}

impl XferRecord {
    /// Record pre-filled from a call result
    pub fn from_result(result: &FaxResult) -> Self {
        let duration = result.duration();
        Self {
            ts: result.start_ts,
            remote_id: result.remote_id.clone(),
            params: encode_params(result.transfer_rate, result.ecm),
            pages: result.transferred_pages,
            jobtime: duration,
            conntime: duration,
            reason: result.result_text.clone(),
            dcs: result
                .page_results
                .first()
                .map(|p| p.encoding_name.clone())
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    fn timestamp(&self) -> String {
        self.ts
            .unwrap_or_else(Utc::now)
            .with_timezone(&Local)
            .format(TS_FORMAT)
            .to_string()
    }

    pub fn format_send(&self) -> String {
        [
            self.timestamp(),
            "SEND".to_string(),
            self.commid.clone(),
            self.modem.clone(),
            self.jobid.to_string(),
            quote(&self.jobtag),
            self.sender.clone(),
            quote(&self.destnum),
            quote(&self.remote_id),
            self.params.to_string(),
            self.pages.to_string(),
            format_duration(self.jobtime),
            format_duration(self.conntime),
            quote(&self.reason),
            quote(""),
            quote(""),
            quote(""),
            quote(&self.owner),
            quote(&self.dcs),
        ]
        .join("\t")
    }

    pub fn format_recv(&self) -> String {
        [
            self.timestamp(),
            "RECV".to_string(),
            self.commid.clone(),
            self.modem.clone(),
            self.filename.clone(),
            quote(""),
            "fax".to_string(),
            quote(&self.destnum),
            quote(&self.remote_id),
            self.params.to_string(),
            self.pages.to_string(),
            format_duration(self.jobtime),
            format_duration(self.conntime),
            quote(&self.reason),
            quote(&self.cidname),
            quote(&self.cidnum),
            quote(""),
            quote(""),
            quote(&self.dcs),
        ]
        .join("\t")
    }

    /// Append a SEND line; no-op without a configured log
    pub async fn save_send(&self, log: Option<&Path>) -> io::Result<()> {
        append(log, self.format_send()).await
    }

    /// Append a RECV line; no-op without a configured log
    pub async fn save_recv(&self, log: Option<&Path>) -> io::Result<()> {
        append(log, self.format_recv()).await
    }
}

async fn append(log: Option<&Path>, line: String) -> io::Result<()> {
    let Some(path) = log else {
        return Ok(());
    };
    let path: PathBuf = path.to_path_buf();
    run_blocking(move || append_line(&path, &line)).await
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s)
}

/// `HH:MM:SS`
pub fn format_duration(d: Duration) -> String {
    let secs = d.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Pack signalling rate and ECM into the xferfaxlog params word
///
/// Rate bucket (0-5) in bits 3..5, ECM in bit 16.
pub fn encode_params(baud_rate: u32, ecm: bool) -> u32 {
    let br: u32 = match baud_rate {
        r if r > 12000 => 5,
        r if r > 9600 => 4,
        r if r > 7200 => 3,
        r if r > 4800 => 2,
        r if r > 2400 => 1,
        _ => 0,
    };
    let ec: u32 = if ecm { 1 } else { 0 };
    (br << 3) | (ec << 16)
}
