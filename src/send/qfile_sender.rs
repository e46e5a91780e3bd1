//! Job runner: sends one HylaFAX queue file and keeps it up to date
//!
//! The scheduler reads the job's progress from the queue file (`status`,
//! dial and try counters, page count) and decides from the exit code what
//! happens to the job next.

use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use super::error::{SendError, SendOutcome};
use super::fax_file::FaxFile;
use super::transmission::{Transmission, TransmissionEvent};
use crate::config::GatewayConfig;
use crate::hylafax::{run_blocking, send_fifo, DynamicConfig, Qfile, QfileError, SessionLog, XferRecord};
use crate::models::{FaxJob, FaxResult};
use crate::server::device::FIFO_PREFIX;

/// Removes the merged document when the job is over
struct TempDocument(PathBuf);

impl Drop for TempDocument {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Cannot remove {}: {}", self.0.display(), e);
            }
        }
    }
}

/// Entry point of `send`
///
/// The modem is marked busy on its control FIFO for the duration of the job.
/// Only the first queue file is sent; the scheduler requeues the others.
pub async fn run_send(
    config: &GatewayConfig,
    device: &str,
    qfiles: &[PathBuf],
    kill: CancellationToken,
) -> SendOutcome {
    let fifo = config
        .hylafax
        .spool_dir
        .join(format!("{}{}", FIFO_PREFIX, device));
    notify_device(&fifo, "SB").await;

    let outcome = match qfiles.split_first() {
        Some((qfile, rest)) => {
            for ignored in rest {
                tracing::warn!("Not sending {}, only one job is sent per call", ignored.display());
            }
            match send_qfile(config, qfile, device, kill).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Error processing qfile {}: {}", qfile.display(), e);
                    e.outcome()
                }
            }
        }
        None => SendOutcome::Failed,
    };

    notify_device(&fifo, "SR").await;
    tracing::info!("Exiting with status {}", outcome.code());
    outcome
}

async fn notify_device(fifo: &Path, message: &'static str) {
    let path = fifo.to_path_buf();
    if let Err(e) = run_blocking(move || send_fifo(&path, message)).await {
        tracing::warn!("Cannot notify modem on {}: {}", fifo.display(), e);
    }
}

/// Send the job in `qfile` through `device`
pub async fn send_qfile(
    config: &GatewayConfig,
    qfile: &Path,
    device: &str,
    kill: CancellationToken,
) -> Result<SendOutcome, SendError> {
    let mut qf = open_qfile(qfile).await?;

    let jobid = match qf.get_string("jobid") {
        "" => 0,
        id => id.parse().unwrap_or_else(|_| {
            tracing::warn!("Error parsing jobid {:?}", id);
            0
        }),
    };

    let mut job = FaxJob {
        number: format!("{}{}", config.outbound.call_prefix, qf.get_string("number")),
        cidnum: config.outbound.fax_number.clone(),
        cidname: qf.get_string("sender").to_string(),
        ident: config.freeswitch.ident.clone(),
        header: config.freeswitch.header.clone(),
        gateways: config.freeswitch.gateways.clone(),
        ..FaxJob::new()
    };
    if let Some(ecm) = qf.get_int("desiredec") {
        job.use_ecm = ecm != 0;
    }
    // Below 14400 bps
    if qf.get_int("desiredbr").is_some_and(|br| br < 5) {
        job.disable_v17 = true;
    }

    if let Some(command) = config.outbound.dynamic_config.as_deref() {
        tracing::info!("Calling DynamicConfig script {}", command);
        let args = [device, qf.get_string("owner"), qf.get_string("number"), qf.get_string("jobid")];
        let dc = match DynamicConfig::query(command, &args).await {
            Ok(dc) => dc,
            Err(e) => return Err(fail_job(&mut qf, SendError::DynamicConfig(e))),
        };
        apply_dynamic_config(&mut job, &dc).map_err(|e| fail_job(&mut qf, e))?;
    }

    let session_log = SessionLog::open(&config.hylafax.spool_dir, jobid)
        .await
        .map_err(SendError::SessionLog)?;
    put(&mut qf, "commid", session_log.comm_id());
    tracing::info!(
        "Logging events for commid {} to {}",
        session_log.comm_id(),
        session_log.path().display()
    );
    session_log.log(format!("Processing HylaFAX Job {} as {}", jobid, job.uuid));

    let mut documents = FaxFile::new(&config.hylafax.spool_dir);
    for entry in qf.get_all("fax") {
        documents.add_item(entry)?;
    }
    if documents.is_empty() {
        return Err(SendError::NoFaxFiles);
    }

    job.filename = std::env::temp_dir().join(format!("faxbridge_{}.tif", job.uuid));
    let _document = TempDocument(job.filename.clone());
    session_log.log(format!(
        "Combining {} document(s) into {}",
        documents.len(),
        job.filename.display()
    ));
    documents
        .write_to(&job.filename, &config.outbound.tiffcp)
        .await?;

    let mut totdials = qf.get_int("totdials").unwrap_or(0);
    let mut ndials = qf.get_int("ndials").unwrap_or(0);
    let mut tottries = qf.get_int("tottries").unwrap_or(0);

    put(&mut qf, "status", "Dialing");
    totdials += 1;
    put(&mut qf, "totdials", totdials.to_string());
    write_qfile(&mut qf, &session_log);

    let mut events = Transmission::new(job, config, session_log.clone(), kill).start();
    let mut outcome = SendOutcome::Retry;
    let mut last_result: Option<FaxResult> = None;
    let mut failure = None;

    while let Some(event) = events.recv().await {
        match event {
            TransmissionEvent::PageSent(page) => {
                put(&mut qf, "npages", page.page.to_string());
                put(&mut qf, "dataformat", page.encoding_name.as_str());
            }
            TransmissionEvent::Negotiated(result) => {
                put(&mut qf, "signalrate", result.transfer_rate.to_string());
                put(&mut qf, "csi", result.remote_id.as_str());
                let mut status = format!("Sending {}", result.transfer_rate);
                if result.ecm {
                    status.push_str("/ECM");
                }
                put(&mut qf, "status", status);
                tottries += 1;
                put(&mut qf, "tottries", tottries.to_string());
                ndials = 0;
                put(&mut qf, "ndials", ndials.to_string());
                last_result = Some(result);
            }
            TransmissionEvent::Finished(result) => {
                put(&mut qf, "signalrate", result.transfer_rate.to_string());
                put(&mut qf, "csi", result.remote_id.as_str());
                put(&mut qf, "status", result.result_text.as_str());
                if result.success {
                    outcome = SendOutcome::Done;
                    put(&mut qf, "returned", outcome.code().to_string());
                }
                session_log.log(format!(
                    "Success: {}, Hangup Cause: {}, Result: {}",
                    result.success, result.hangup_cause, result.result_text
                ));
                last_result = Some(result);
            }
            TransmissionEvent::Failed(e) => {
                ndials += 1;
                put(&mut qf, "ndials", ndials.to_string());
                put(&mut qf, "status", e.message());
                outcome = if e.retry() {
                    SendOutcome::Retry
                } else {
                    SendOutcome::Failed
                };
                failure = Some(e);
            }
        }
        write_qfile(&mut qf, &session_log);
    }

    if let Some(result) = &last_result {
        let mut record = XferRecord::from_result(result);
        record.commid = session_log.comm_id().to_string();
        record.modem = device.to_string();
        record.jobid = jobid;
        record.jobtag = qf.get_string("jobtag").to_string();
        record.sender = qf.get_string("mailaddr").to_string();
        record.destnum = qf.get_string("number").to_string();
        record.owner = qf.get_string("owner").to_string();
        if let Err(e) = record.save_send(config.hylafax.xferfaxlog.as_deref()).await {
            session_log.log(format!("Cannot write transmission log: {}", e));
        }
    }

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(outcome),
    }
}

async fn open_qfile(path: &Path) -> Result<Qfile, SendError> {
    let owned = path.to_path_buf();
    let opened = tokio::task::spawn_blocking(move || Qfile::open(owned))
        .await
        .map_err(|e| QfileError::Io(io::Error::other(e)))
        .and_then(|opened| opened);
    opened.map_err(|source| SendError::Qfile {
        path: path.display().to_string(),
        source,
    })
}

fn apply_dynamic_config(job: &mut FaxJob, dc: &DynamicConfig) -> Result<(), SendError> {
    if dc.reject_call() {
        return Err(SendError::Rejected);
    }

    let ident = dc.get("LocalIdentifier");
    if !ident.is_empty() {
        job.ident = ident.to_string();
    }
    let tagline = dc.get("TagLine");
    if !tagline.is_empty() {
        job.header = tagline.to_string();
    }
    let fax_number = dc.get("FAXNumber");
    if !fax_number.is_empty() {
        job.cidnum = fax_number.to_string();
    }
    let gateways = dc.get("Gateway");
    if !gateways.is_empty() {
        job.gateways = gateways
            .split(',')
            .map(|gw| gw.trim().to_string())
            .filter(|gw| !gw.is_empty())
            .collect();
    }
    Ok(())
}

/// Record why the job failed before dialing
fn fail_job(qf: &mut Qfile, err: SendError) -> SendError {
    tracing::error!("{}", err);
    put(qf, "status", err.to_string());
    if let Err(e) = qf.write() {
        tracing::error!("Error updating qfile: {}", e);
    }
    err
}

/// Set `tag`, adding it if the scheduler did not write it
fn put(qf: &mut Qfile, tag: &str, value: impl Into<String>) {
    let value = value.into();
    if !qf.set(tag, value.clone()) {
        qf.add(tag, value);
    }
}

fn write_qfile(qf: &mut Qfile, log: &SessionLog) {
    if let Err(e) = qf.write() {
        log.log(format!("Error updating qfile: {}", e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hylafax::LOG_DIR;
    use crate::send::error::FaxError;
    use crate::testing::{api_response, plain_event, FakeSwitch};
    use std::os::unix::fs::PermissionsExt;

    const QFILE: &str = "jobid:17\njobtag:invoice\nnumber:0301234567\nsender:Alice\nowner:alice\nmailaddr:alice@example.com\nfax:0::docq/doc17.tif\nstatus:\ntotdials:0\nndials:0\ntottries:0\n";

    struct Job {
        spool: tempfile::TempDir,
        qfile: PathBuf,
        config: GatewayConfig,
    }

    fn script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn job(content: &str) -> Job {
        let spool = tempfile::tempdir().unwrap();
        for dir in [LOG_DIR, "docq", "sendq", "etc", "bin"] {
            std::fs::create_dir(spool.path().join(dir)).unwrap();
        }
        std::fs::write(spool.path().join("docq/doc17.tif"), b"II*\0").unwrap();
        let qfile = spool.path().join("sendq/q17");
        std::fs::write(&qfile, content).unwrap();

        // Stand-in for tiffcp: copy the single input to the output
        let tiffcp = spool.path().join("bin/tiffcp");
        script(&tiffcp, "for arg; do out=$arg; done\ncp \"${2%%,*}\" \"$out\"\n");

        let mut config = GatewayConfig::default();
        config.hylafax.spool_dir = spool.path().to_path_buf();
        config.hylafax.xferfaxlog = Some(spool.path().join("etc/xferfaxlog"));
        config.freeswitch.gateways = vec!["sipgate".to_string()];
        config.outbound.tiffcp = tiffcp.display().to_string();
        config.outbound.call_prefix = "0".to_string();
        Job { spool, qfile, config }
    }

    fn read_qfile(path: &Path) -> Qfile {
        Qfile::parse(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn tx_event(subclass: &str, fields: &[(&str, &str)]) -> String {
        let mut headers = vec![("Event-Name", "CUSTOM"), ("Event-Subclass", subclass)];
        headers.extend_from_slice(fields);
        plain_event(&headers)
    }

    #[test]
    fn test_dynamic_config_overrides() {
        let mut job = FaxJob::new();
        job.gateways = vec!["default".to_string()];
        let dc = DynamicConfig::parse(
            "LocalIdentifier: +49 30 999\nTagLine: ACME\nFAXNumber: 4930999\nGateway: a, b\n",
        );

        apply_dynamic_config(&mut job, &dc).unwrap();
        assert_eq!(job.ident, "+49 30 999");
        assert_eq!(job.header, "ACME");
        assert_eq!(job.cidnum, "4930999");
        assert_eq!(job.gateways, vec!["a", "b"]);

        let reject = DynamicConfig::parse("RejectCall: yes\n");
        assert!(matches!(apply_dynamic_config(&mut job, &reject), Err(SendError::Rejected)));
    }

    #[tokio::test]
    async fn test_rejected_job_is_marked_failed() {
        let mut j = job(QFILE);
        let dynconf = j.spool.path().join("bin/dynconf");
        script(&dynconf, "[ \"$1\" = freeswitch0 ] && echo 'RejectCall: true'\n");
        j.config.outbound.dynamic_config = Some(dynconf.display().to_string());

        let result = send_qfile(&j.config, &j.qfile, "freeswitch0", CancellationToken::new()).await;

        let err = result.unwrap_err();
        assert!(matches!(err, SendError::Rejected));
        assert_eq!(err.outcome(), SendOutcome::Failed);
        let qf = read_qfile(&j.qfile);
        assert_eq!(qf.get_string("status"), "Transmission rejected by DynamicConfig");
        assert_eq!(qf.get_string("totdials"), "0");
    }

    #[tokio::test]
    async fn test_job_without_documents() {
        let j = job("jobid:18\nnumber:0301234567\n");
        let result = send_qfile(&j.config, &j.qfile, "freeswitch0", CancellationToken::new()).await;
        assert!(matches!(result, Err(SendError::NoFaxFiles)));
    }

    #[tokio::test]
    async fn test_missing_qfile() {
        let j = job(QFILE);
        let missing = j.spool.path().join("sendq/q99");
        let result = send_qfile(&j.config, &missing, "freeswitch0", CancellationToken::new()).await;
        assert!(matches!(result, Err(SendError::Qfile { .. })));

        // No FIFO for the modem either; the job still ends cleanly
        let outcome = run_send(&j.config, "freeswitch9", &[missing], CancellationToken::new()).await;
        assert_eq!(outcome, SendOutcome::Failed);
    }

    #[tokio::test]
    async fn test_successful_job() {
        let (addr, commands) = FakeSwitch::new()
            .on(
                "api originate",
                api_response("+OK\n"),
                vec![
                    plain_event(&[("Event-Name", "CHANNEL_CALLSTATE"), ("Channel-Call-State", "ACTIVE")]),
                    tx_event(
                        "spandsp::txfaxnegociateresult",
                        &[
                            ("Fax-Transfer-Rate", "14400"),
                            ("Fax-Ecm-Used", "on"),
                            ("Fax-Remote-Station-Id", "+49 30 1234567"),
                        ],
                    ),
                    tx_event(
                        "spandsp::txfaxpageresult",
                        &[("Fax-Document-Transferred-Pages", "1"), ("Fax-Encoding-Name", "T.6")],
                    ),
                    tx_event(
                        "spandsp::txfaxresult",
                        &[
                            ("Fax-Success", "1"),
                            ("Fax-Result-Text", "OK"),
                            ("Fax-Document-Transferred-Pages", "1"),
                            ("Fax-Transfer-Rate", "14400"),
                            ("Fax-Ecm-Used", "on"),
                            ("Fax-Remote-Station-Id", "+49 30 1234567"),
                        ],
                    ),
                    plain_event(&[
                        ("Event-Name", "CHANNEL_CALLSTATE"),
                        ("Channel-Call-State", "HANGUP"),
                        ("Hangup-Cause", "NORMAL_CLEARING"),
                    ]),
                ],
            )
            .listen()
            .await;
        let mut j = job(QFILE);
        j.config.freeswitch.socket = addr.to_string();

        let outcome = send_qfile(&j.config, &j.qfile, "freeswitch0", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, SendOutcome::Done);
        assert!(commands.contains("sofia/gateway/sipgate/00301234567"));
        assert!(commands.contains("origination_caller_id_name='Alice'"));

        let qf = read_qfile(&j.qfile);
        assert_eq!(qf.get_string("status"), "OK");
        assert_eq!(qf.get_string("returned"), "2");
        assert_eq!(qf.get_string("commid"), "00000001");
        assert_eq!(qf.get_string("totdials"), "1");
        assert_eq!(qf.get_string("tottries"), "1");
        assert_eq!(qf.get_string("ndials"), "0");
        assert_eq!(qf.get_string("npages"), "1");
        assert_eq!(qf.get_string("dataformat"), "T.6");
        assert_eq!(qf.get_string("signalrate"), "14400");
        assert_eq!(qf.get_string("csi"), "+49 30 1234567");

        let xferfaxlog = std::fs::read_to_string(j.spool.path().join("etc/xferfaxlog")).unwrap();
        let fields: Vec<&str> = xferfaxlog.trim_end().split('\t').collect();
        assert_eq!(fields.len(), 19);
        assert_eq!(&fields[1..4], &["SEND", "00000001", "freeswitch0"]);
        assert!(fields.contains(&"17"));
        assert!(fields.iter().any(|f| f.contains("invoice")));
    }

    #[tokio::test]
    async fn test_busy_line_is_retried() {
        let (addr, _) = FakeSwitch::new()
            .on("api originate", api_response("-ERR USER_BUSY\n"), vec![])
            .listen()
            .await;
        let mut j = job(QFILE);
        j.config.freeswitch.socket = addr.to_string();

        let err = send_qfile(&j.config, &j.qfile, "freeswitch0", CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(&err, SendError::Fax(e) if *e == FaxError::new("USER_BUSY", true)));
        assert_eq!(err.outcome(), SendOutcome::Retry);
        let qf = read_qfile(&j.qfile);
        assert_eq!(qf.get_string("status"), "USER_BUSY");
        assert_eq!(qf.get_string("ndials"), "1");
        assert_eq!(qf.get_string("totdials"), "1");
        assert!(!j.spool.path().join("etc/xferfaxlog").exists());
    }
}
