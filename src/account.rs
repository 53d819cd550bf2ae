//! ACME 帳戶的建立與恢復。
//!
//! 帳戶由金鑰對與 CA 指派的 location URI 組成。location 會寫入 `.txt` 檔案，
//! 之後再次執行時直接以同一把金鑰恢復帳戶，不會重新註冊。

use thiserror::Error;

use crate::{
    client::{with_retries, AcmeApi, ApiError},
    key_pair::{KeyError, KeyPair},
    payload::NewAccountPayload,
    poll::RetryPolicy,
    storage::{Storage, StorageError},
};

/// 定義與帳戶相關的錯誤類型。
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Account creation failed: {0}")]
    Creation(String),
    #[error("The CA requires agreeing to its terms of service: {terms_url}")]
    TermsNotAccepted { terms_url: String },
    #[error("Network error: {0}")]
    Network(#[source] ApiError),
    #[error("Unexpected CA response: {0}")]
    Api(#[source] ApiError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Account location {location_path} exists but its key {key_path} is missing")]
    OrphanedAccount {
        key_path: String,
        location_path: String,
    },
}

impl From<ApiError> for AccountError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Rejected { problem, .. } => AccountError::Creation(problem.to_string()),
            e if e.is_retryable() => AccountError::Network(e),
            e => AccountError::Api(e),
        }
    }
}

type Result<T> = std::result::Result<T, AccountError>;

/// 已在 CA 註冊的帳戶。之後所有請求都以 `location` 作為 `kid` 簽署。
#[derive(Debug, Clone)]
pub struct Account {
    pub key_pair: KeyPair,
    pub location: String,
}

/// 帳戶 location 檔案必須使用的副檔名。
pub const LOCATION_EXTENSION: &str = ".txt";

/// 建立或恢復 ACME 帳戶。
#[derive(Debug)]
pub struct AccountRegistrar<'a> {
    api: &'a dyn AcmeApi,
    storage: &'a dyn Storage,
    location_path: String,
    contact: Vec<String>,
    retry: RetryPolicy,
}

impl<'a> AccountRegistrar<'a> {
    /// 建立註冊器。
    ///
    /// # 參數
    ///
    /// - `api`: 與 CA 溝通的傳輸層。
    /// - `storage`: 保存帳戶金鑰與 location 檔案。
    /// - `location_path`: location 檔案路徑，必須以 `.txt` 結尾。
    pub fn new(
        api: &'a dyn AcmeApi,
        storage: &'a dyn Storage,
        location_path: impl Into<String>,
    ) -> Self {
        Self {
            api,
            storage,
            location_path: location_path.into(),
            contact: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn contact<S: AsRef<str>>(mut self, emails: &[S]) -> Self {
        self.contact = emails.iter().map(|e| e.as_ref().to_string()).collect();
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn location_path(&self) -> &str {
        &self.location_path
    }

    fn check_location_path(&self) -> Result<()> {
        if self.location_path.ends_with(LOCATION_EXTENSION) {
            Ok(())
        } else {
            Err(AccountError::Validation(format!(
                "Account location file must end with {}: {}",
                LOCATION_EXTENSION, self.location_path
            )))
        }
    }

    /// 載入帳戶金鑰；不存在時產生並保存一把新的。
    ///
    /// 若 location 檔案已存在但金鑰遺失，代表帳戶已註冊過，此時不會產生新金鑰，
    /// 而是回傳 [`AccountError::OrphanedAccount`]。
    pub fn ensure_account_key(&self, key_path: &str, bits: u32) -> Result<KeyPair> {
        self.check_location_path()?;
        if !key_path.ends_with(KeyPair::FILE_EXTENSION) {
            return Err(KeyError::Validation(format!(
                "Key file must end with {}: {}",
                KeyPair::FILE_EXTENSION,
                key_path
            ))
            .into());
        }

        if self.storage.exists(key_path)? {
            tracing::debug!(key_path, "Loading existing account key");
            return Ok(KeyPair::load(self.storage, key_path)?);
        }
        if self.storage.exists(&self.location_path)? {
            return Err(AccountError::OrphanedAccount {
                key_path: key_path.to_string(),
                location_path: self.location_path.clone(),
            });
        }

        tracing::info!(key_path, bits, "Generating account key");
        let key_pair = KeyPair::generate(bits)?;
        key_pair.save(self.storage, key_path)?;
        Ok(key_pair)
    }

    /// 以 `key_pair` 恢復既有帳戶，或在 CA 註冊新帳戶。
    ///
    /// 同一把金鑰重複呼叫會得到同一個 location；CA 回應 `200 OK`
    /// （帳戶已存在）與 `201 Created` 都視為成功。
    pub fn register_or_resume(&self, key_pair: KeyPair, accept_terms: bool) -> Result<Account> {
        self.check_location_path()?;

        if self.storage.exists(&self.location_path)? {
            let location = self.storage.read_string(&self.location_path)?;
            if !location.is_empty() {
                tracing::debug!(%location, "Resuming account from location file");
                return Ok(Account { key_pair, location });
            }
        }

        let directory = with_retries(&self.retry, "fetch directory", || self.api.directory())?;
        if let Some(terms_url) = directory.terms_of_service() {
            if !accept_terms {
                return Err(AccountError::TermsNotAccepted {
                    terms_url: terms_url.to_string(),
                });
            }
        }

        let payload = NewAccountPayload::new(&self.contact, accept_terms);
        let resource = with_retries(&self.retry, "new account", || {
            self.api.new_account(&key_pair, &payload)
        })?;
        if matches!(resource.status.as_str(), "deactivated" | "revoked") {
            return Err(AccountError::Creation(format!(
                "Account {} is {}",
                resource.location, resource.status
            )));
        }

        self.storage
            .write_file(&self.location_path, resource.location.as_bytes())?;
        if resource.created {
            tracing::info!(location = %resource.location, "Created ACME account");
        } else {
            tracing::info!(location = %resource.location, "Found existing ACME account for key");
        }

        Ok(Account {
            key_pair,
            location: resource.location,
        })
    }
}
