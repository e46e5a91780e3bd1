use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// T.38 negotiation flags for a single call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct T38Flags {
    pub enable: bool,
    pub request: bool,
}

impl T38Flags {
    pub fn new(enable: bool, request: bool) -> Self {
        Self { enable, request }
    }

    /// Softmodem fallback forces audio-only transmission
    pub fn disabled() -> Self {
        Self {
            enable: false,
            request: false,
        }
    }
}

/// One outbound transmission attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaxJob {
    /// Channel UUID, generated by us and handed to the switch
    pub uuid: Uuid,
    pub number: String,
    pub cidnum: String,
    pub cidname: String,
    /// Merged TIFF to send
    pub filename: PathBuf,
    pub use_ecm: bool,
    pub disable_v17: bool,
    pub ident: String,
    /// Page header text (sender company name); empty disables the header
    pub header: String,
    /// Gateways to try, in order
    pub gateways: Vec<String>,
}

impl Default for FaxJob {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            number: String::new(),
            cidnum: String::new(),
            cidname: String::new(),
            filename: PathBuf::new(),
            use_ecm: true,
            disable_v17: false,
            ident: String::new(),
            header: String::new(),
            gateways: Vec::new(),
        }
    }
}

impl FaxJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel variables and the pipe-separated gateway chain for `originate`
    pub fn dial_string(&self, t38: T38Flags, verbose: bool) -> String {
        let variables = [
            ("ignore_early_media", "true".to_string()),
            ("origination_uuid", self.uuid.to_string()),
            ("origination_caller_id_number", self.cidnum.clone()),
            ("origination_caller_id_name", self.cidname.clone()),
            ("fax_ident", self.ident.clone()),
            ("fax_header", self.header.clone()),
            ("fax_use_ecm", self.use_ecm.to_string()),
            ("fax_disable_v17", self.disable_v17.to_string()),
            ("fax_enable_t38", t38.enable.to_string()),
            ("fax_enable_t38_request", t38.request.to_string()),
            ("fax_verbose", verbose.to_string()),
        ]
        .iter()
        .map(|(name, value)| format!("{}='{}'", name, value))
        .collect::<Vec<_>>()
        .join(",");

        let gateways = self
            .gateways
            .iter()
            .map(|gw| format!("sofia/gateway/{}/{}", gw, self.number))
            .collect::<Vec<_>>()
            .join("|");

        format!("{{{}}}{}", variables, gateways)
    }
}
