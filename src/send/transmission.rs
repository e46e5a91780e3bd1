//! One outbound fax call
//!
//! A [`Transmission`] dials the switch, originates the call with `txfax`
//! attached and reports progress on a channel until the call is over.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::FaxError;
use crate::config::{FreeswitchConfig, GatewayConfig};
use crate::esl::{EslConnection, EslError, EventStream};
use crate::fallback::SoftmodemFallback;
use crate::hylafax::SessionLog;
use crate::models::{FaxJob, FaxResult, PageResult, T38Flags};

const SUBSCRIPTION: &str = "event plain CHANNEL_CALLSTATE CUSTOM \
     spandsp::txfaxnegociateresult spandsp::txfaxpageresult spandsp::txfaxresult";

const NEGOTIATE_RESULT: &str = "spandsp::txfaxnegociateresult";

/// Progress of a transmission; the last event is `Finished` or `Failed`
#[derive(Debug, Clone)]
pub enum TransmissionEvent {
    PageSent(PageResult),
    /// Snapshot after (re)negotiation
    Negotiated(FaxResult),
    /// The call was hung up; the result may still be unsuccessful
    Finished(FaxResult),
    /// The call could not be placed or the connection broke
    Failed(FaxError),
}

pub struct Transmission {
    job: FaxJob,
    freeswitch: FreeswitchConfig,
    t38: T38Flags,
    session_log: SessionLog,
    kill: CancellationToken,
}

impl Transmission {
    pub fn new(
        job: FaxJob,
        config: &GatewayConfig,
        session_log: SessionLog,
        kill: CancellationToken,
    ) -> Self {
        Self {
            job,
            freeswitch: config.freeswitch.clone(),
            t38: T38Flags::new(config.outbound.enable_t38, config.outbound.request_t38),
            session_log,
            kill,
        }
    }

    /// Run the call in the background
    pub fn start(self) -> mpsc::Receiver<TransmissionEvent> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            if let Err(e) = self.transmit(&tx).await {
                let _ = tx.send(TransmissionEvent::Failed(e)).await;
            }
        });
        rx
    }

    fn log(&self, message: impl std::fmt::Display) {
        self.session_log.log(message);
    }

    async fn transmit(&self, tx: &mpsc::Sender<TransmissionEvent>) -> Result<(), FaxError> {
        if self.job.number.is_empty() {
            return Err(FaxError::new("Number to dial is empty", false));
        }
        if self.job.gateways.is_empty() {
            return Err(FaxError::new("Gateway not set", false));
        }
        if let Err(e) = tokio::fs::metadata(&self.job.filename).await {
            return Err(FaxError::new(
                format!("{}: {}", self.job.filename.display(), e),
                false,
            ));
        }

        let mut conn = EslConnection::dial(self.freeswitch.socket.as_str(), &self.freeswitch.password)
            .await
            .map_err(retryable)?;
        let outcome = self.call(&mut conn, tx).await;
        conn.close().await;
        outcome
    }

    async fn call(
        &self,
        conn: &mut EslConnection,
        tx: &mpsc::Sender<TransmissionEvent>,
    ) -> Result<(), FaxError> {
        let mut stream = conn
            .take_event_stream()
            .ok_or_else(|| FaxError::new("Event stream unavailable", true))?;

        conn.send(&format!("filter Unique-ID {}", self.job.uuid))
            .await
            .map_err(retryable)?;
        conn.send(SUBSCRIPTION).await.map_err(retryable)?;

        let fallback = SoftmodemFallback::new(self.freeswitch.softmodem_fallback);
        let mut t38 = self.t38;
        match fallback.is_active(conn, &self.job.number).await {
            Ok(true) => {
                self.log(format!(
                    "Softmodem fallback active for destination {}, disabling T.38",
                    self.job.number
                ));
                t38 = T38Flags::disabled();
            }
            Ok(false) => {}
            Err(e) => self.log(e),
        }

        self.originate(conn, t38).await?;
        self.event_loop(conn, &mut stream, fallback, tx).await
    }

    async fn originate(&self, conn: &mut EslConnection, t38: T38Flags) -> Result<(), FaxError> {
        let dial_string = self.job.dial_string(t38, self.freeswitch.verbose);
        self.log(format!(
            "Originating channel to {} using gateway {}",
            self.job.number,
            self.job.gateways.join(",")
        ));

        let command = format!(
            "originate {}, &txfax({})",
            dial_string,
            self.job.filename.display()
        );
        match conn.api(&command).await {
            Ok(_) => {
                self.log("Originate successful");
                Ok(())
            }
            Err(EslError::CommandFailed(cause)) => {
                self.log(format!("Originate failed with hangup cause {}", cause));
                let retry = !self.freeswitch.is_failed_cause(&cause);
                Err(FaxError::new(cause, retry))
            }
            Err(e) => Err(retryable(e)),
        }
    }

    async fn event_loop(
        &self,
        conn: &mut EslConnection,
        stream: &mut EventStream,
        fallback: SoftmodemFallback,
        tx: &mpsc::Sender<TransmissionEvent>,
    ) -> Result<(), FaxError> {
        let mut result = FaxResult::new(self.job.uuid, Some(self.session_log.clone()));
        let mut pages = 0;

        loop {
            tokio::select! {
                biased;

                _ = self.kill.cancelled() => {
                    self.log(format!("{} Kill request received, destroying channel", self.job.uuid));
                    if let Err(e) = conn.api(&format!("uuid_kill {}", self.job.uuid)).await {
                        self.log(e);
                    }
                    if let Err(e) = tokio::fs::remove_file(&self.job.filename).await {
                        tracing::debug!("Removing {}: {}", self.job.filename.display(), e);
                    }
                    return Err(FaxError::new("Killed", false));
                }

                ev = stream.events.recv() => {
                    let Some(ev) = ev else {
                        return Err(retryable(EslError::ConnectionClosed));
                    };
                    if ev.is_disconnect_notice() {
                        continue;
                    }

                    result.add_event(&ev);
                    if result.is_terminal() {
                        fallback
                            .escalate_after_failure(conn, &result, &self.job.number, &self.session_log)
                            .await;
                        let _ = tx.send(TransmissionEvent::Finished(result)).await;
                        return Ok(());
                    }

                    if ev.subclass() == NEGOTIATE_RESULT {
                        let _ = tx.send(TransmissionEvent::Negotiated(result.clone())).await;
                    } else if result.transferred_pages != pages {
                        pages = result.transferred_pages;
                        if let Some(page) = result.page_results.last() {
                            let _ = tx.send(TransmissionEvent::PageSent(page.clone())).await;
                        }
                    }
                }

                err = &mut stream.errors => {
                    let e = err.unwrap_or(EslError::ConnectionClosed);
                    return Err(retryable(e));
                }
            }
        }
    }
}

fn retryable(e: EslError) -> FaxError {
    FaxError::new(e.to_string(), true)
}
