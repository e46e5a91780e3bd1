//! Gateway configuration
//!
//! Settings come from `FAXBRIDGE_*` environment variables, optionally seeded
//! from a dotenv-style file given with `-c`.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::hylafax::parse_bool;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/faxbridge.conf";

/// Hangup causes that make a retry pointless
pub const DEFAULT_FAILED_CAUSES: &[&str] = &[
    "UNALLOCATED_NUMBER",
    "NO_ROUTE_DESTINATION",
    "INVALID_NUMBER_FORMAT",
    "CALL_REJECTED",
    "NUMBER_CHANGED",
    "INCOMPATIBLE_DESTINATION",
    "FACILITY_REJECTED",
    "BEARERCAPABILITY_NOTAUTH",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    File {
        path: String,
        source: dotenvy::Error,
    },

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Connection to the switch and per-call fax settings
#[derive(Debug, Clone)]
pub struct FreeswitchConfig {
    /// Switch's inbound event socket, `host:port`
    pub socket: String,
    pub password: String,
    /// Gateways tried in order for outbound calls
    pub gateways: Vec<String>,
    pub ident: String,
    pub header: String,
    pub verbose: bool,
    pub softmodem_fallback: bool,
    /// Originate failures with these causes are not retried
    pub failed_causes: Vec<String>,
}

impl FreeswitchConfig {
    pub fn is_failed_cause(&self, cause: &str) -> bool {
        self.failed_causes.iter().any(|c| c == cause)
    }
}

impl Default for FreeswitchConfig {
    fn default() -> Self {
        Self {
            socket: "127.0.0.1:8021".to_string(),
            password: "ClueCon".to_string(),
            gateways: Vec::new(),
            ident: String::new(),
            header: String::new(),
            verbose: false,
            softmodem_fallback: false,
            failed_causes: DEFAULT_FAILED_CAUSES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HylafaxConfig {
    pub spool_dir: PathBuf,
    pub modems: u32,
    /// `None` disables the transmission log
    pub xferfaxlog: Option<PathBuf>,
}

impl Default for HylafaxConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::new(),
            modems: 1,
            xferfaxlog: None,
        }
    }
}

/// Receiving side (`serve`)
#[derive(Debug, Clone)]
pub struct InboundConfig {
    /// Where the switch connects for inbound calls
    pub socket: String,
    /// Milliseconds to ring before answering
    pub answer_after_ms: u64,
    /// Milliseconds of silence played after answering
    pub wait_time_ms: u64,
    pub faxrcvd_cmd: String,
    pub dynamic_config: Option<String>,
    pub allocate_devices: bool,
    pub recipient_from_diversion: bool,
    pub enable_t38: bool,
    pub request_t38: bool,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            socket: "127.0.0.1:8022".to_string(),
            answer_after_ms: 0,
            wait_time_ms: 0,
            faxrcvd_cmd: "bin/faxrcvd".to_string(),
            dynamic_config: None,
            allocate_devices: true,
            recipient_from_diversion: false,
            enable_t38: true,
            request_t38: true,
        }
    }
}

/// Sending side (`send`)
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub fax_number: String,
    pub call_prefix: String,
    pub dynamic_config: Option<String>,
    pub enable_t38: bool,
    pub request_t38: bool,
    /// Tool combining the job's documents into one TIFF
    pub tiffcp: String,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            fax_number: String::new(),
            call_prefix: String::new(),
            dynamic_config: None,
            tiffcp: "tiffcp".to_string(),
            enable_t38: true,
            request_t38: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub freeswitch: FreeswitchConfig,
    pub hylafax: HylafaxConfig,
    pub inbound: InboundConfig,
    pub outbound: OutboundConfig,
}

impl GatewayConfig {
    /// Load `file` into the environment (if given or present) and read the config
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let path = file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        match dotenvy::from_path(path) {
            Ok(()) => tracing::info!("Loaded configuration from {}", path.display()),
            // A missing default file is fine; a missing explicit one is not
            Err(e) if file.is_none() && e.not_found() => {
                tracing::debug!("No config file at {}", path.display())
            }
            Err(source) => {
                return Err(ConfigError::File {
                    path: path.display().to_string(),
                    source,
                })
            }
        }

        let config = Self::from_env()?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str, default: bool| get(key).map(|v| parse_bool(&v)).unwrap_or(default);
        let list = |key: &str| {
            get(key).map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
        };

        let defaults = Self::default();

        let spool_dir = get("FAXBRIDGE_SPOOL_DIR")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("FAXBRIDGE_SPOOL_DIR"))?;

        let freeswitch = FreeswitchConfig {
            socket: get("FAXBRIDGE_FREESWITCH_SOCKET").unwrap_or(defaults.freeswitch.socket),
            password: get("FAXBRIDGE_FREESWITCH_PASSWORD").unwrap_or(defaults.freeswitch.password),
            gateways: list("FAXBRIDGE_FREESWITCH_GATEWAYS").unwrap_or_default(),
            ident: get("FAXBRIDGE_FREESWITCH_IDENT").unwrap_or_default(),
            header: get("FAXBRIDGE_FREESWITCH_HEADER").unwrap_or_default(),
            verbose: flag("FAXBRIDGE_FREESWITCH_VERBOSE", false),
            softmodem_fallback: flag("FAXBRIDGE_SOFTMODEM_FALLBACK", false),
            failed_causes: list("FAXBRIDGE_FAILED_HANGUP_CAUSES")
                .unwrap_or(defaults.freeswitch.failed_causes),
        };

        let hylafax = HylafaxConfig {
            spool_dir,
            modems: parse_num(&get, "FAXBRIDGE_MODEMS", defaults.hylafax.modems)?,
            xferfaxlog: get("FAXBRIDGE_XFERFAXLOG").map(PathBuf::from),
        };

        let inbound = InboundConfig {
            socket: get("FAXBRIDGE_INBOUND_SOCKET").unwrap_or(defaults.inbound.socket),
            answer_after_ms: parse_num(&get, "FAXBRIDGE_INBOUND_ANSWER_AFTER", 0)?,
            wait_time_ms: parse_num(&get, "FAXBRIDGE_INBOUND_WAIT_TIME", 0)?,
            faxrcvd_cmd: get("FAXBRIDGE_INBOUND_FAXRCVD_CMD").unwrap_or(defaults.inbound.faxrcvd_cmd),
            dynamic_config: get("FAXBRIDGE_INBOUND_DYNAMIC_CONFIG"),
            allocate_devices: flag("FAXBRIDGE_INBOUND_ALLOCATE_DEVICES", defaults.inbound.allocate_devices),
            recipient_from_diversion: flag("FAXBRIDGE_INBOUND_RECIPIENT_FROM_DIVERSION", false),
            enable_t38: flag("FAXBRIDGE_INBOUND_ENABLE_T38", defaults.inbound.enable_t38),
            request_t38: flag("FAXBRIDGE_INBOUND_REQUEST_T38", defaults.inbound.request_t38),
        };

        let outbound = OutboundConfig {
            fax_number: get("FAXBRIDGE_OUTBOUND_FAX_NUMBER").unwrap_or_default(),
            call_prefix: get("FAXBRIDGE_OUTBOUND_CALL_PREFIX").unwrap_or_default(),
            dynamic_config: get("FAXBRIDGE_OUTBOUND_DYNAMIC_CONFIG"),
            enable_t38: flag("FAXBRIDGE_OUTBOUND_ENABLE_T38", defaults.outbound.enable_t38),
            request_t38: flag("FAXBRIDGE_OUTBOUND_REQUEST_T38", defaults.outbound.request_t38),
            tiffcp: get("FAXBRIDGE_OUTBOUND_TIFFCP").unwrap_or(defaults.outbound.tiffcp),
        };

        Ok(Self {
            freeswitch,
            hylafax,
            inbound,
            outbound,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.hylafax.spool_dir.as_os_str().is_empty() {
            return Err("spool directory is required".to_string());
        }
        if self.freeswitch.socket.is_empty() {
            return Err("FreeSWITCH event socket address is required".to_string());
        }
        if self.inbound.socket.is_empty() {
            return Err("inbound listen socket is required".to_string());
        }
        Ok(())
    }
}

fn parse_num<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}
