//! Site-provided DynamicConfig scripts
//!
//! The script is run with call-specific arguments and prints `Tag: value`
//! lines. Tags are matched case-insensitively; lines without a colon are
//! ignored.

use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum DynamicConfigError {
    #[error("No DynamicConfig command provided")]
    NoCommand,

    #[error("Cannot run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("{command} exited with {status}")]
    Failed { command: String, status: String },
}

#[derive(Debug, Clone, Default)]
pub struct DynamicConfig {
    params: Vec<(String, String)>,
}

impl DynamicConfig {
    /// Run `command` with `args` and parse its standard output
    pub async fn query(command: &str, args: &[&str]) -> Result<Self, DynamicConfigError> {
        if command.is_empty() {
            return Err(DynamicConfigError::NoCommand);
        }

        tracing::info!("Calling DynamicConfig script {} {:?}", command, args);
        let output = Command::new(command)
            .args(args)
            .output()
            .await
            .map_err(|source| DynamicConfigError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(DynamicConfigError::Failed {
                command: command.to_string(),
                status: output.status.to_string(),
            });
        }

        Ok(Self::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    pub fn parse(text: &str) -> Self {
        let params = text
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(tag, value)| (tag.trim().to_lowercase(), value.trim().to_string()))
            .collect();
        Self { params }
    }

    /// First value for `tag`, or the empty string
    pub fn get(&self, tag: &str) -> &str {
        let tag = tag.to_lowercase();
        self.params
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn reject_call(&self) -> bool {
        parse_bool(self.get("RejectCall"))
    }
}

/// `true`, `1` and `yes` (any case) are true, everything else false
pub fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_case_insensitive() {
        let dc = DynamicConfig::parse("RejectCall: yes\nLocalIdentifier:  +49 30 1234 \ngarbage\nGateway: a,b\n");
        assert!(dc.reject_call());
        assert_eq!(dc.get("localidentifier"), "+49 30 1234");
        assert_eq!(dc.get("GATEWAY"), "a,b");
        assert_eq!(dc.get("TagLine"), "");
    }

    #[test]
    fn test_parse_bool() {
        for v in ["true", "TRUE", "1", "Yes"] {
            assert!(parse_bool(v), "{}", v);
        }
        for v in ["", "false", "0", "no", "on"] {
            assert!(!parse_bool(v), "{}", v);
        }
    }

    #[tokio::test]
    async fn test_query_runs_script_with_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("dynconf");
        std::fs::write(&script, "#!/bin/sh\necho \"LocalIdentifier: $1-$2\"\necho 'RejectCall: false'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dc = DynamicConfig::query(script.to_str().unwrap(), &["freeswitch0", "4930"])
            .await
            .unwrap();
        assert_eq!(dc.get("LocalIdentifier"), "freeswitch0-4930");
        assert!(!dc.reject_call());
    }

    #[tokio::test]
    async fn test_query_failing_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("dynconf");
        std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let result = DynamicConfig::query(script.to_str().unwrap(), &[]).await;
        assert!(matches!(result, Err(DynamicConfigError::Failed { .. })));
        assert!(matches!(DynamicConfig::query("", &[]).await, Err(DynamicConfigError::NoCommand)));
    }
}
