//! Inbound fax sessions
//!
//! The switch connects to us once per incoming call (outbound socket mode).
//! Each connection walks through a fixed sequence of phases:
//! - Connect, Subscribe: take over the channel and listen to its fax events
//! - Identify, Policy: work out who is calling, apply DynamicConfig and
//!   softmodem fallback, optionally reserve a modem for status reporting
//! - Answer, Receive: pick up and start `rxfax` into the receive queue
//! - EventLoop: feed events into the [`FaxResult`] until hangup or kill
//! - Report: transmission log, fallback escalation, `faxrcvd`

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use uuid::Uuid;

use super::device::Device;
use super::manager::MODEM_PREFIX;
use super::ServerContext;
use crate::esl::{EslConnection, EslError, Event, EventStream};
use crate::fallback::SoftmodemFallback;
use crate::hylafax::{sequence_for, DynamicConfig, SessionLog, XferRecord};
use crate::models::{FaxResult, T38Flags};

pub const RECVQ_DIR: &str = "recvq";

const SUBSCRIPTION: &str = "event plain CHANNEL_CALLSTATE CUSTOM \
     spandsp::rxfaxnegociateresult spandsp::rxfaxpageresult spandsp::rxfaxresult";

const RECEIVING: &str = "Receiving facsimile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connect,
    Subscribe,
    Identify,
    Policy,
    Answer,
    Receive,
    EventLoop,
    Report,
    Done,
}

/// Ways a session ends early
enum Abort {
    /// Refuse the call with "not found"
    Reject(String),
    /// Drop the control connection
    Exit(String),
    /// Channel already destroyed by a kill request
    Killed,
}

impl From<EslError> for Abort {
    fn from(e: EslError) -> Self {
        Abort::Exit(e.to_string())
    }
}

#[derive(Debug, Default)]
struct Caller {
    recipient: String,
    gateway: String,
    cidname: String,
    cidnum: String,
}

pub struct InboundSession {
    ctx: ServerContext,
    conn: EslConnection,
    fallback: SoftmodemFallback,
    channel: Uuid,
    channel_data: Event,
    caller: Caller,
    csi: String,
    t38: T38Flags,
    /// Modem name reported to the queue manager and `faxrcvd`
    modem: String,
    device: Option<Device>,
    session_log: Option<SessionLog>,
    events: Option<EventStream>,
    /// Received file, relative to the spool
    filename: String,
    result: FaxResult,
}

impl InboundSession {
    pub fn new(ctx: ServerContext, conn: EslConnection) -> Self {
        let fallback = SoftmodemFallback::new(ctx.config.freeswitch.softmodem_fallback);
        Self {
            ctx,
            conn,
            fallback,
            channel: Uuid::nil(),
            channel_data: Event::new(),
            caller: Caller::default(),
            csi: String::new(),
            t38: T38Flags::disabled(),
            modem: MODEM_PREFIX.to_string(),
            device: None,
            session_log: None,
            events: None,
            filename: String::new(),
            result: FaxResult::default(),
        }
    }

    /// Drive the call to completion; errors never escape the session
    pub async fn run(mut self) {
        tracing::info!("Incoming Event Socket connection from {}", self.conn.peer());

        let mut phase = Phase::Connect;
        while phase != Phase::Done {
            let next = match phase {
                Phase::Connect => self.connect().await,
                Phase::Subscribe => self.subscribe().await,
                Phase::Identify => self.identify(),
                Phase::Policy => self.policy().await,
                Phase::Answer => self.answer().await,
                Phase::Receive => self.receive().await,
                Phase::EventLoop => self.event_loop().await,
                Phase::Report => self.report().await,
                Phase::Done => Ok(Phase::Done),
            };
            phase = match next {
                Ok(next) => next,
                Err(abort) => {
                    self.abort(abort).await;
                    Phase::Done
                }
            };
        }

        self.release_device().await;
        tracing::info!("{} Handler ending", self.channel);
    }

    async fn connect(&mut self) -> Result<Phase, Abort> {
        let data = self.conn.send("connect").await?;
        self.channel = Uuid::parse_str(data.get("Unique-ID"))
            .map_err(|e| Abort::Exit(format!("Invalid channel UUID: {}", e)))?;
        self.channel_data = data;
        Ok(Phase::Subscribe)
    }

    async fn subscribe(&mut self) -> Result<Phase, Abort> {
        self.conn.send("linger").await?;
        self.conn
            .send(&format!("filter Unique-ID {}", self.channel))
            .await?;
        self.conn.send(SUBSCRIPTION).await?;
        self.events = self.conn.take_event_stream();
        Ok(Phase::Identify)
    }

    fn identify(&mut self) -> Result<Phase, Abort> {
        let data = &self.channel_data;
        let recipient = if self.ctx.config.inbound.recipient_from_diversion {
            number_from_sip_uri(data.get("Variable_sip_h_diversion"))
                .ok_or_else(|| {
                    Abort::Reject("Number could not be extracted from SIP URI".to_string())
                })?
                .to_string()
        } else {
            data.get("Variable_sip_to_user").to_string()
        };

        self.caller = Caller {
            recipient,
            gateway: data.get("Variable_sip_gateway").to_string(),
            cidname: data.get("Channel-Caller-Id-Name").to_string(),
            cidnum: data.get("Channel-Caller-Id-Number").to_string(),
        };
        tracing::info!(
            "Incoming call to {} from {} <{}> via gateway {}",
            self.caller.recipient,
            self.caller.cidname,
            self.caller.cidnum,
            self.caller.gateway
        );
        Ok(Phase::Policy)
    }

    async fn policy(&mut self) -> Result<Phase, Abort> {
        let config = self.ctx.config.clone();
        let inbound = &config.inbound;
        self.csi = config.freeswitch.ident.clone();

        // A rejected call must leave every modem untouched
        if let Some(command) = inbound.dynamic_config.as_deref() {
            let device = match inbound.allocate_devices {
                true => self.ctx.devices.next_ready().await,
                false => None,
            }
            .unwrap_or_else(|| MODEM_PREFIX.to_string());

            tracing::info!("Calling DynamicConfig script {}", command);
            let args = [
                device.as_str(),
                self.caller.cidnum.as_str(),
                self.caller.cidname.as_str(),
                self.caller.recipient.as_str(),
                self.caller.gateway.as_str(),
            ];
            match DynamicConfig::query(command, &args).await {
                Ok(dc) => {
                    if dc.reject_call() {
                        return Err(Abort::Reject(
                            "DynamicConfig decided to reject this call".to_string(),
                        ));
                    }
                    let ident = dc.get("LocalIdentifier");
                    if !ident.is_empty() {
                        self.csi = ident.to_string();
                    }
                }
                Err(e) => tracing::warn!("Error calling DynamicConfig: {}", e),
            }
        }

        if inbound.allocate_devices {
            let device = self
                .ctx
                .devices
                .allocate(RECEIVING)
                .await
                .map_err(|e| Abort::Reject(e.to_string()))?;
            self.modem = device.name().to_string();
            self.device = Some(device);
        }

        let log = SessionLog::open(&config.hylafax.spool_dir, 0)
            .await
            .map_err(|e| Abort::Exit(format!("Cannot open session log: {}", e)))?;
        tracing::info!(
            "{} Logging events for commid {} to {}",
            self.channel,
            log.comm_id(),
            log.path().display()
        );
        log.log(format!("Inbound channel UUID: {}", self.channel));
        self.session_log = Some(log);

        self.t38 = T38Flags::new(inbound.enable_t38, inbound.request_t38);
        let fallback = self.fallback;
        match fallback.is_active(&mut self.conn, &self.caller.cidnum).await {
            Ok(true) => {
                self.log(format!(
                    "Softmodem fallback active for caller {}, disabling T.38",
                    self.caller.cidnum
                ));
                self.t38 = T38Flags::disabled();
            }
            Ok(false) => {}
            Err(e) => self.log(e),
        }

        self.log(format!(
            "Accepting call to {} from {} <{}> via gateway {} with commid {}",
            self.caller.recipient,
            self.caller.cidname,
            self.caller.cidnum,
            self.caller.gateway,
            self.comm_id()
        ));

        if let Some(device) = &self.device {
            let status = format!("I{}", self.comm_id());
            if let Err(e) = self.ctx.faxq.modem_status(device.name(), &status).await {
                self.log(e);
            }
            self.notify_receive("B").await;
            self.notify_receive("S").await;
        }
        Ok(Phase::Answer)
    }

    async fn answer(&mut self) -> Result<Phase, Abort> {
        let config = self.ctx.config.clone();
        let inbound = &config.inbound;

        if inbound.answer_after_ms != 0 {
            self.conn.execute("ring_ready", "").await?;
            self.conn
                .execute("sleep", &inbound.answer_after_ms.to_string())
                .await?;
        }

        self.conn.execute("answer", "").await?;

        if inbound.wait_time_ms != 0 {
            self.conn
                .execute(
                    "playback",
                    &format!("silence_stream://{}", inbound.wait_time_ms),
                )
                .await?;
        }
        Ok(Phase::Receive)
    }

    async fn receive(&mut self) -> Result<Phase, Abort> {
        let config = self.ctx.config.clone();
        let spool = &config.hylafax.spool_dir;

        let seq = sequence_for(spool, RECVQ_DIR)
            .await
            .map_err(|e| Abort::Exit(format!("Cannot allocate receive file: {}", e)))?;
        self.filename = format!("{}/fax{:08}.tif", RECVQ_DIR, seq);
        let target = spool.join(&self.filename);
        self.log(format!("Rxfax to {}", target.display()));

        self.conn
            .execute("set", &format!("fax_enable_t38={}", self.t38.enable))
            .await?;
        self.conn
            .execute("set", &format!("fax_enable_t38_request={}", self.t38.request))
            .await?;
        self.conn
            .execute("set", &format!("fax_ident={}", self.csi))
            .await?;
        self.conn
            .execute("rxfax", &target.display().to_string())
            .await?;
        self.conn.execute("hangup", "").await?;

        self.result = FaxResult::new(self.channel, self.session_log.clone());
        Ok(Phase::EventLoop)
    }

    async fn event_loop(&mut self) -> Result<Phase, Abort> {
        let Some(mut stream) = self.events.take() else {
            return Err(Abort::Exit("Event stream unavailable".to_string()));
        };
        let kill = self.ctx.kill.clone();
        let mut pages = self.result.transferred_pages;

        loop {
            tokio::select! {
                biased;

                _ = kill.cancelled() => {
                    self.log("Kill request received, destroying channel");
                    if let Err(e) = self.conn.api(&format!("uuid_kill {}", self.channel)).await {
                        self.log(e);
                    }
                    self.conn.close().await;
                    return Err(Abort::Killed);
                }

                ev = stream.events.recv() => match ev {
                    Some(ev) if ev.is_disconnect_notice() => {
                        self.log("Received disconnect message");
                    }
                    Some(ev) => {
                        self.result.add_event(&ev);
                        if self.result.is_terminal() {
                            self.conn.close().await;
                            break;
                        }
                        if pages != self.result.transferred_pages {
                            pages = self.result.transferred_pages;
                            self.notify_receive("P").await;
                        }
                    }
                    None => {
                        self.log("Event socket client disconnected");
                        break;
                    }
                },

                err = &mut stream.errors => {
                    match err {
                        Ok(EslError::ConnectionClosed) | Err(_) => {
                            self.log("Event socket client disconnected")
                        }
                        Ok(e) => self.log(format!("Error: {}", e)),
                    }
                    break;
                }
            }
        }
        Ok(Phase::Report)
    }

    async fn report(&mut self) -> Result<Phase, Abort> {
        self.notify_receive("D").await;
        self.release_device().await;

        self.log(format!(
            "Success: {}, Hangup Cause: {}, Result: {}",
            self.result.success, self.result.hangup_cause, self.result.result_text
        ));

        let config = self.ctx.config.clone();

        let mut record = XferRecord::from_result(&self.result);
        record.commid = self.comm_id().to_string();
        record.modem = self.modem.clone();
        record.filename = self.filename.clone();
        record.destnum = self.caller.recipient.clone();
        record.cidnum = self.caller.cidnum.clone();
        record.cidname = self.caller.cidname.clone();
        if let Err(e) = record.save_recv(config.hylafax.xferfaxlog.as_deref()).await {
            self.log(format!("Cannot write transmission log: {}", e));
        }

        if let Some(log) = &self.session_log {
            self.fallback
                .escalate_via(
                    &config.freeswitch.socket,
                    &config.freeswitch.password,
                    &self.result,
                    &self.caller.cidnum,
                    log,
                )
                .await;
        }

        self.run_faxrcvd(&config.hylafax.spool_dir, &config.inbound.faxrcvd_cmd)
            .await;
        Ok(Phase::Done)
    }

    async fn run_faxrcvd(&self, spool: &Path, command: &str) {
        let program = resolve_command(spool, command);
        let errmsg = if self.result.success {
            ""
        } else {
            self.result.result_text.as_str()
        };
        let args = [
            self.filename.as_str(),
            self.modem.as_str(),
            self.comm_id(),
            errmsg,
            self.caller.cidnum.as_str(),
            self.caller.cidname.as_str(),
            self.caller.recipient.as_str(),
            self.caller.gateway.as_str(),
        ];

        self.log(format!("Calling {} {:?}", program.display(), args));
        let output = Command::new(&program)
            .args(args)
            .current_dir(spool)
            .env("HANGUPCAUSE", &self.result.hangup_cause)
            .env("TRANSFER_RATE", self.result.transfer_rate.to_string())
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                self.log(format!("{} ended successfully", program.display()));
            }
            Ok(output) => {
                self.log(format!("{} ended with {}", program.display(), output.status));
                self.log(String::from_utf8_lossy(&output.stdout));
                self.log(String::from_utf8_lossy(&output.stderr));
            }
            Err(e) => self.log(format!("{} ended with {}", program.display(), e)),
        }
    }

    async fn abort(&mut self, abort: Abort) {
        match abort {
            Abort::Reject(reason) => {
                self.log(reason);
                if let Err(e) = self.conn.execute("respond", "404").await {
                    tracing::debug!("Cannot reject call: {}", e);
                }
                self.exit().await;
            }
            Abort::Exit(reason) => {
                self.log(reason);
                self.exit().await;
            }
            Abort::Killed => {
                // Shutdown takes the modem down; it must not come back Ready
                self.notify_receive("E").await;
                self.device = None;
            }
        }
    }

    async fn exit(&mut self) {
        if let Err(e) = self.conn.send("exit").await {
            tracing::debug!("Cannot send exit to {}: {}", self.conn.peer(), e);
        }
    }

    /// End-of-reception notice and back to Ready; no-op once released
    async fn release_device(&mut self) {
        if self.device.is_none() {
            return;
        }
        self.notify_receive("E").await;
        if let Some(device) = self.device.take() {
            device.set_ready();
        }
    }

    async fn notify_receive(&self, code: &str) {
        let Some(device) = &self.device else {
            return;
        };
        if let Err(e) = self.ctx.faxq.receive_status(device.name(), code).await {
            self.log(e);
        }
    }

    fn comm_id(&self) -> &str {
        self.session_log
            .as_ref()
            .map(|log| log.comm_id())
            .unwrap_or_default()
    }

    fn log(&self, message: impl fmt::Display) {
        match &self.session_log {
            Some(log) => log.log(message),
            None => tracing::info!("{} {}", self.channel, message),
        }
    }
}

/// Digits of the first `sip:<digits>@` in a header value
fn number_from_sip_uri(uri: &str) -> Option<&str> {
    uri.match_indices("sip:").find_map(|(i, prefix)| {
        let rest = &uri[i + prefix.len()..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        (end > 0 && rest[end..].starts_with('@')).then(|| &rest[..end])
    })
}

/// Relative commands with a directory part are taken relative to the spool
fn resolve_command(spool: &Path, command: &str) -> PathBuf {
    let path = Path::new(command);
    if path.is_relative() && path.components().count() > 1 {
        spool.join(path)
    } else {
        path.to_path_buf()
    }
}
