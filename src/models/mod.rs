pub mod fax_job;
pub mod fax_result;

pub use fax_job::*;
pub use fax_result::*;
