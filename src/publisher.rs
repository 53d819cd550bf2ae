//! HTTP-01 挑戰內容的發佈端。
//!
//! 本工具不實作網頁伺服器，只負責把 `token → 內容` 交給外部，使
//! `http://{domain}/.well-known/acme-challenge/{token}` 能原樣回傳內容。
//! 每個 token 各自獨立保存，多個網域可以同時發佈而互不覆蓋。

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use thiserror::Error;

use crate::storage::{FsStorage, Storage, StorageError};

/// 挑戰檔案相對於網站根目錄的路徑前綴。
pub const CHALLENGE_PATH: &str = ".well-known/acme-challenge";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Invalid challenge token: {0}")]
    InvalidToken(String),
    #[error("Published content for token {0} is not retrievable")]
    NotRetrievable(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Lock poisoned")]
    LockPoisoned,
}

type Result<T> = std::result::Result<T, PublishError>;

/// 發佈與撤下挑戰內容的協作者介面。
///
/// `publish` 返回時，內容必須已可被讀取。
pub trait ChallengePublisher: Send + Sync + fmt::Debug {
    fn publish(&self, token: &str, content: &str) -> Result<()>;

    fn unpublish(&self, token: &str) -> Result<()>;
}

/// token 由 CA 產生，但仍會被拿來組成路徑，只接受 base64url 字元。
fn check_token(token: &str) -> Result<()> {
    let valid = !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(PublishError::InvalidToken(token.to_string()))
    }
}

/// 將挑戰內容寫入網站根目錄下的 `.well-known/acme-challenge/{token}`。
#[derive(Debug)]
pub struct WebrootPublisher {
    webroot: PathBuf,
    storage: FsStorage,
}

impl WebrootPublisher {
    /// 網頁伺服器需要讀取挑戰檔案，因此使用 `0o644`。
    const FILE_MODE: u32 = 0o644;

    /// # 參數
    ///
    /// * `webroot` - 網站根目錄，挑戰檔案寫在其下的 `.well-known/acme-challenge/`。
    pub fn new(webroot: impl Into<PathBuf>) -> Self {
        let webroot = webroot.into();
        let storage = FsStorage::rooted(&webroot).with_mode(Self::FILE_MODE);
        Self { webroot, storage }
    }

    pub fn webroot(&self) -> &PathBuf {
        &self.webroot
    }

    fn key(token: &str) -> String {
        format!("{}/{}", CHALLENGE_PATH, token)
    }
}

impl ChallengePublisher for WebrootPublisher {
    fn publish(&self, token: &str, content: &str) -> Result<()> {
        check_token(token)?;
        let key = Self::key(token);
        self.storage.write_file(&key, content.as_bytes())?;
        // 觸發驗證前先確認檔案內容可讀回
        if self.storage.read_string(&key)? != content {
            return Err(PublishError::NotRetrievable(token.to_string()));
        }
        tracing::debug!(token, webroot = %self.webroot.display(), "Published challenge file");
        Ok(())
    }

    fn unpublish(&self, token: &str) -> Result<()> {
        check_token(token)?;
        self.storage.remove(&Self::key(token))?;
        Ok(())
    }
}

/// 保存在記憶體中的發佈端，適合嵌入自帶 HTTP 伺服器的程式，由伺服器呼叫 [`MemPublisher::get`] 回應請求。
#[derive(Debug, Default, Clone)]
pub struct MemPublisher {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.entries.read().ok()?.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChallengePublisher for MemPublisher {
    fn publish(&self, token: &str, content: &str) -> Result<()> {
        check_token(token)?;
        self.entries
            .write()
            .map_err(|_| PublishError::LockPoisoned)?
            .insert(token.to_string(), content.to_string());
        Ok(())
    }

    fn unpublish(&self, token: &str) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| PublishError::LockPoisoned)?
            .remove(token);
        Ok(())
    }
}
