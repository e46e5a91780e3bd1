//! HylaFAX side of the gateway
//!
//! Everything that touches the HylaFAX spool area:
//! - Queue manager notifications over its control FIFO
//! - Modem control FIFOs and status files
//! - Sequence counters, session logs and the transmission log
//! - Job queue files and DynamicConfig scripts

mod dynamic_config;
mod faxq;
mod fifo;
mod qfile;
mod session_log;
mod spool;
mod xferfaxlog;

pub use dynamic_config::{parse_bool, DynamicConfig, DynamicConfigError};
pub use faxq::FaxqNotifier;
pub use fifo::{ensure_fifo, send_fifo, FifoStream};
pub use qfile::{Qfile, QfileError};
pub use session_log::SessionLog;
pub use spool::{run_blocking, sequence_for, write_status_file};
pub use xferfaxlog::XferRecord;

// Used by test doubles and fixtures
#[allow(unused_imports)]
pub use faxq::{FaxqError, NotifySink};
#[allow(unused_imports)]
pub use session_log::LOG_DIR;
