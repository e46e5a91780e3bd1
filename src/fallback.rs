//! Softmodem fallback
//!
//! Remote parties whose faxes keep failing over T.38 are remembered in the
//! switch's key/value store. Later calls to or from them run audio-only.
//! Flags are never cleared by the gateway.

use chrono::Utc;

use crate::esl::{EslConnection, EslError, KeyValueStore};
use crate::hylafax::SessionLog;
use crate::models::FaxResult;

pub const FALLBACK_REALM: &str = "fallback";

#[derive(Debug, Clone, Copy)]
pub struct SoftmodemFallback {
    enabled: bool,
}

impl SoftmodemFallback {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether calls with `remote_id` should avoid T.38
    pub async fn is_active<S>(&self, store: &mut S, remote_id: &str) -> Result<bool, EslError>
    where
        S: KeyValueStore + ?Sized,
    {
        if !self.enabled || remote_id.is_empty() {
            return Ok(false);
        }
        store.db_exists(FALLBACK_REALM, remote_id).await
    }

    /// Remember `remote_id`, stamped with the current time
    pub async fn activate<S>(&self, store: &mut S, remote_id: &str) -> Result<(), EslError>
    where
        S: KeyValueStore + ?Sized,
    {
        if !self.enabled || remote_id.is_empty() {
            return Ok(());
        }
        let stamp = Utc::now().timestamp().to_string();
        store.db_insert(FALLBACK_REALM, remote_id, &stamp).await
    }

    /// Escalation rule for a finished, failed call
    ///
    /// Repeated negotiation or any bad rows mean the medium is unreliable.
    pub fn should_escalate(result: &FaxResult) -> bool {
        !result.success && (result.negotiate_count > 1 || result.total_bad_rows() > 0)
    }

    /// Apply the escalation rule and record the flag if it matches
    pub async fn escalate_after_failure<S>(
        &self,
        store: &mut S,
        result: &FaxResult,
        remote_id: &str,
        log: &SessionLog,
    ) where
        S: KeyValueStore + ?Sized,
    {
        if !self.enabled || !Self::should_escalate(result) {
            return;
        }

        if result.negotiate_count > 1 {
            log.log(format!(
                "Fax failed with {} negotiations, enabling softmodem fallback for calls from/to {}.",
                result.negotiate_count, remote_id
            ));
        } else {
            log.log(format!(
                "Fax failed with {} bad rows in {} pages, enabling softmodem fallback for calls from/to {}.",
                result.total_bad_rows(),
                result.transferred_pages,
                remote_id
            ));
        }

        if let Err(e) = self.activate(store, remote_id).await {
            log.log(format!("Cannot store softmodem fallback flag: {}", e));
        }
    }

    /// Same as [`escalate_after_failure`](Self::escalate_after_failure) over a
    /// fresh connection to the switch
    pub async fn escalate_via(
        &self,
        socket: &str,
        password: &str,
        result: &FaxResult,
        remote_id: &str,
        log: &SessionLog,
    ) {
        if !self.enabled || remote_id.is_empty() || !Self::should_escalate(result) {
            return;
        }
        match EslConnection::dial(socket, password).await {
            Ok(mut conn) => {
                self.escalate_after_failure(&mut conn, result, remote_id, log)
                    .await;
                conn.close().await;
            }
            Err(e) => log.log(format!("Cannot connect to FreeSWITCH for softmodem fallback: {}", e)),
        }
    }
}
