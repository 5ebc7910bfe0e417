//! Authority configuration.
//!
//! The CA profile is JSON with kebab-case keys; missing mandatory fields
//! refuse startup. Challenge-specific settings live in sibling files in
//! the same directory: `challenge-credential.conf` (possession trust
//! anchors) and `challenge-email.conf` (address whitelist).
//!
//! When no config path is given, `NDNCERT_SYSCONFDIR` selects the
//! directory, falling back to `/etc/ndncert`.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::Deserialize;

use namecert_core::cert::CertError;
use namecert_core::proto::CaProfile;
use namecert_core::{Certificate, Name};

pub const CA_CONFIG_FILE: &str = "ca.conf";
pub const CREDENTIAL_CONFIG_FILE: &str = "challenge-credential.conf";
pub const EMAIL_CONFIG_FILE: &str = "challenge-email.conf";

const SYSCONFDIR_ENV: &str = "NDNCERT_SYSCONFDIR";
const DEFAULT_SYSCONFDIR: &str = "/etc/ndncert";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid anchor certificate: {0}")]
    Anchor(#[from] CertError),
}

/// The directory configuration files are read from when no explicit
/// path is provided.
pub fn default_config_dir() -> PathBuf {
    std::env::var_os(SYSCONFDIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSCONFDIR))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProbeParameterEntry {
    pub probe_parameter_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ChallengeEntry {
    pub challenge: String,
}

/// Which name-assignment policy the probe handler runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentKind {
    /// Join the probe parameter values in configured key order.
    #[default]
    Param,
    /// Assign a random 64-bit suffix.
    Random,
}

/// `ca.conf`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CaConfig {
    pub ca_prefix: String,
    pub ca_info: String,
    /// Seconds.
    pub max_validity_period: u64,
    #[serde(default)]
    pub max_suffix_length: Option<u64>,
    #[serde(default)]
    pub probe_parameters: Vec<ProbeParameterEntry>,
    pub supported_challenges: Vec<ChallengeEntry>,
    #[serde(default)]
    pub name_assignment: Option<AssignmentKind>,
}

impl CaConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.prefix()?;
        if prefix.is_empty() {
            return Err(ConfigError::Invalid("ca-prefix must not be empty".into()));
        }
        if self.max_validity_period == 0 {
            return Err(ConfigError::Invalid(
                "max-validity-period must be positive".into(),
            ));
        }
        if self.supported_challenges.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one supported challenge is required".into(),
            ));
        }
        for entry in &self.supported_challenges {
            if entry.challenge.trim().is_empty() {
                return Err(ConfigError::Invalid("challenge name must not be empty".into()));
            }
        }
        for entry in &self.probe_parameters {
            if entry.probe_parameter_key.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "probe parameter key must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn prefix(&self) -> Result<Name, ConfigError> {
        Name::parse(&self.ca_prefix)
            .map_err(|_| ConfigError::Invalid("ca-prefix does not parse as a name".into()))
    }

    /// Challenge names, lowercased for registry lookup.
    pub fn challenge_names(&self) -> Vec<String> {
        self.supported_challenges
            .iter()
            .map(|entry| entry.challenge.to_lowercase())
            .collect()
    }

    pub fn probe_parameter_keys(&self) -> Vec<String> {
        self.probe_parameters
            .iter()
            .map(|entry| entry.probe_parameter_key.to_lowercase())
            .collect()
    }

    /// Assemble the wire-facing profile around the CA certificate.
    pub fn profile(&self, certificate: Certificate) -> Result<CaProfile, ConfigError> {
        Ok(CaProfile {
            ca_prefix: self.prefix()?,
            ca_info: self.ca_info.clone(),
            max_validity_period: Duration::seconds(self.max_validity_period.min(i64::MAX as u64) as i64),
            max_suffix_length: self.max_suffix_length,
            probe_parameter_keys: self.probe_parameter_keys(),
            supported_challenges: self.challenge_names(),
            certificate,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct AnchorEntry {
    certificate: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct CredentialConfig {
    anchor_list: Vec<AnchorEntry>,
}

/// Load the possession trust anchors from `challenge-credential.conf`.
pub fn load_trust_anchors(path: &Path) -> Result<Vec<Certificate>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    let config: CredentialConfig =
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
    if config.anchor_list.is_empty() {
        return Err(ConfigError::Invalid("anchor-list must not be empty".into()));
    }
    config
        .anchor_list
        .iter()
        .map(|entry| Certificate::from_pem(&entry.certificate).map_err(ConfigError::from))
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EmailConfig {
    /// Regexes an address must match; empty admits everything.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// Load the email challenge policy; a missing file means no restriction.
pub fn load_email_config(path: &Path) -> Result<EmailConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(EmailConfig::default())
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_owned(),
                source,
            })
        }
    };
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "ca-prefix": "/edu/site",
        "ca-info": "Site certificate authority",
        "max-validity-period": 2592000,
        "max-suffix-length": 2,
        "probe-parameters": [{"probe-parameter-key": "email"}],
        "supported-challenges": [{"challenge": "Possession"}, {"challenge": "email"}],
        "name-assignment": "random"
    }"#;

    #[test]
    fn full_config_parses() {
        let config = CaConfig::from_json(FULL).unwrap();
        assert_eq!(config.prefix().unwrap().to_string(), "/edu/site");
        assert_eq!(config.challenge_names(), vec!["possession", "email"]);
        assert_eq!(config.probe_parameter_keys(), vec!["email"]);
        assert_eq!(config.name_assignment, Some(AssignmentKind::Random));
    }

    #[test]
    fn missing_mandatory_field_refused() {
        let text = r#"{"ca-info": "x", "max-validity-period": 100,
                       "supported-challenges": [{"challenge": "email"}]}"#;
        assert!(CaConfig::from_json(text).is_err());
    }

    #[test]
    fn unknown_key_refused() {
        let text = r#"{"ca-prefix": "/x", "ca-info": "", "max-validity-period": 100,
                       "supported-challenges": [{"challenge": "email"}],
                       "surprise": true}"#;
        assert!(CaConfig::from_json(text).is_err());
    }

    #[test]
    fn empty_challenge_list_refused() {
        let text = r#"{"ca-prefix": "/x", "ca-info": "", "max-validity-period": 100,
                       "supported-challenges": []}"#;
        assert!(CaConfig::from_json(text).is_err());
    }

    #[test]
    fn zero_validity_refused() {
        let text = r#"{"ca-prefix": "/x", "ca-info": "", "max-validity-period": 0,
                       "supported-challenges": [{"challenge": "email"}]}"#;
        assert!(CaConfig::from_json(text).is_err());
    }
}
