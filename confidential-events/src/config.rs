//! Configuration.
use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{Context as _, Result};

use crate::{
    error::Error,
    keys::KeyAgreement,
    session::Options,
    types::{parse_address, parse_tx_hash, AadMode, KeyAgreementMode, H160, H256},
};

/// Environment variable that holds the path of the configuration file.
pub const CONFIG_PATH_ENV: &str = "CONFIDENTIAL_EVENTS_CONFIG";

/// Default JSON-RPC endpoint.
const DEFAULT_RPC_URL: &str = "http://localhost:8545";
/// Default log polling interval (in seconds).
const DEFAULT_POLL_INTERVAL: u64 = 5;

/// Raw configuration as serialized.
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    /// JSON-RPC endpoint of the network.
    pub rpc_url: Option<String>,
    /// Node-managed account used to send emitting calls. Defaults to the node's first account.
    pub from: Option<String>,
    /// Address of the emitting contract.
    pub contract: Option<String>,
    /// Action to run: `emit`, `decrypt` or `listen`.
    pub action: String,
    /// Key agreement mode.
    pub mode: Option<KeyAgreementMode>,
    /// Hex-encoded 32-byte pre-shared key.
    pub key: Option<String>,
    /// Hex-encoded 32-byte X25519 secret of the caller.
    pub secret: Option<String>,
    /// Associated data mode.
    pub aad_mode: Option<AadMode>,
    /// Derive per-message keys from the session key.
    #[serde(alias = "hkdf")]
    pub per_message_keys: bool,
    /// Message to emit.
    pub message: Option<String>,
    /// Hash of the transaction to decrypt.
    pub transaction: Option<String>,
    /// Interval on which new logs are polled while listening (in seconds).
    pub poll_interval: Option<u64>,
    /// Log level.
    pub log_level: Option<String>,
}

impl RawConfig {
    /// Load the raw configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }
}

/// Action selected by the configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Emit { message: Vec<u8> },
    Decrypt { transaction: H256 },
    Listen,
}

/// Validated configuration.
pub struct Config {
    pub rpc_url: String,
    pub from: Option<H160>,
    pub contract: Option<H160>,
    pub action: Action,
    pub agreement: KeyAgreement,
    pub options: Options,
    pub poll_interval: Duration,
    pub log_level: slog::Level,
}

impl Config {
    /// Load and validate the configuration from the file named by [`CONFIG_PATH_ENV`].
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .with_context(|| format!("{CONFIG_PATH_ENV} is not set"))?;
        let raw = RawConfig::from_file(path)?;
        Ok(Self::from_raw(raw)?)
    }

    /// Validate a raw configuration.
    pub fn from_raw(raw: RawConfig) -> Result<Self, Error> {
        let contract = raw.contract.as_deref().map(parse_address).transpose()?;
        let from = raw.from.as_deref().map(parse_address).transpose()?;
        let mode = raw.mode.unwrap_or(KeyAgreementMode::PreSharedKey);

        let agreement = match mode {
            KeyAgreementMode::PreSharedKey => {
                if raw.secret.is_some() {
                    return Err(Error::InvalidConfig(
                        "secret is only used with ECDH key agreement".to_string(),
                    ));
                }
                KeyAgreement::pre_shared_key(raw.key.as_deref())?
            }
            KeyAgreementMode::EcdhDerived => {
                if raw.key.is_some() {
                    return Err(Error::InvalidConfig(
                        "key is only used with pre-shared key agreement".to_string(),
                    ));
                }
                KeyAgreement::ecdh(raw.secret.as_deref())?
            }
        };

        let action = match raw.action.as_str() {
            "emit" => {
                let message = raw
                    .message
                    .ok_or_else(|| missing("message", "emit"))?
                    .into_bytes();
                Action::Emit { message }
            }
            "decrypt" => {
                let transaction = raw
                    .transaction
                    .as_deref()
                    .ok_or_else(|| missing("transaction", "decrypt"))
                    .and_then(parse_tx_hash)?;
                Action::Decrypt { transaction }
            }
            "listen" => Action::Listen,
            other => {
                return Err(Error::InvalidConfig(format!("unknown action '{other}'")));
            }
        };

        match &action {
            Action::Emit { .. } | Action::Listen if contract.is_none() => {
                return Err(missing("contract", &raw.action));
            }
            Action::Decrypt { .. } | Action::Listen if !agreement.is_supplied() => {
                let what = match mode {
                    KeyAgreementMode::PreSharedKey => "key",
                    KeyAgreementMode::EcdhDerived => "secret",
                };
                return Err(missing(what, &raw.action));
            }
            _ => {}
        }

        let poll_interval = match raw.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL) {
            0 => {
                return Err(Error::InvalidConfig(
                    "poll interval must be positive".to_string(),
                ))
            }
            secs => Duration::from_secs(secs),
        };
        let log_level = raw
            .log_level
            .as_deref()
            .map(|level| {
                slog::Level::from_str(level)
                    .map_err(|_| Error::InvalidConfig(format!("unknown log level '{level}'")))
            })
            .transpose()?
            .unwrap_or(slog::Level::Info);

        Ok(Self {
            rpc_url: raw.rpc_url.unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            from,
            contract,
            action,
            agreement,
            options: Options {
                aad_mode: raw.aad_mode.unwrap_or_default(),
                per_message_keys: raw.per_message_keys,
            },
            poll_interval,
            log_level,
        })
    }
}

fn missing(what: &str, action: &str) -> Error {
    Error::InvalidConfig(format!("{what} is required for {action}"))
}
