//! 執行設定。以 JSON 檔案描述，所有欄位都有預設值。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    directory::LETS_ENCRYPT_STAGING,
    key_pair::KeyPair,
    order::OrderSettings,
    poll::{PollPolicy, RetryPolicy},
    storage::{Storage, StorageError},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Storage(#[from] StorageError),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub directory_url: String,
    pub account_key_path: String,
    pub account_location_path: String,
    pub key_bits: u32,
    pub accept_terms: bool,
    pub contact: Vec<String>,
    pub domains: Vec<String>,
    pub organization: Option<String>,
    pub not_after: Option<DateTime<Utc>>,
    pub certificate_key_path: Option<String>,
    pub csr_path: Option<String>,
    pub chain_path: String,
    /// HTTP-01 檔案寫入的網站根目錄。
    pub webroot: String,
    pub challenge_poll: PollPolicy,
    pub order_poll: PollPolicy,
    pub retry: RetryPolicy,
    pub concurrency: usize,
    /// `check` 指令判斷需要續約的剩餘天數。
    pub renew_before_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_STAGING.to_string(),
            account_key_path: "account/key.pem".to_string(),
            account_location_path: "account/location.txt".to_string(),
            key_bits: KeyPair::DEFAULT_BITS,
            accept_terms: false,
            contact: Vec::new(),
            domains: Vec::new(),
            organization: None,
            not_after: None,
            certificate_key_path: Some("certs/key.pem".to_string()),
            csr_path: Some("certs/request.csr".to_string()),
            chain_path: "certs/chain.pem".to_string(),
            webroot: "/var/www/html".to_string(),
            challenge_poll: PollPolicy::challenge_default(),
            order_poll: PollPolicy::order_default(),
            retry: RetryPolicy::default(),
            concurrency: 1,
            renew_before_days: 30,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let bytes = storage.read_file(path)?;
        let config = serde_json::from_slice(&bytes)?;
        tracing::debug!(path, "Loaded config");
        Ok(config)
    }

    pub fn order_settings(&self) -> OrderSettings {
        let mut settings = OrderSettings::new(&self.domains, self.chain_path.clone());
        settings.organization = self.organization.clone();
        settings.not_after = self.not_after;
        settings.csr_path = self.csr_path.clone();
        settings.certificate_key_path = self.certificate_key_path.clone();
        settings.key_bits = self.key_bits;
        settings.challenge_poll = self.challenge_poll;
        settings.order_poll = self.order_poll;
        settings.retry = self.retry;
        settings.concurrency = self.concurrency;
        settings
    }
}
