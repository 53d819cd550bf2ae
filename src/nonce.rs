use std::sync::Mutex;

use reqwest::blocking::Client;
use thiserror::Error;

/// 表示在取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    #[error("Failed to make request: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("No Replay-Nonce header found in response")]
    NoNonceHeader,
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::ToStrError),
}

/// 定義取得 Nonce 的行為。
pub trait NonceT: Send + Sync {
    /// 取得一個尚未使用過的 Nonce。
    fn get(&self) -> Result<String, NonceError>;

    /// 回收伺服器在回應中附帶的 `Replay-Nonce`，供下一次請求使用。
    fn put(&self, _nonce: String) {}
}

/// 透過 `newNonce` 端點取得 Nonce，並快取回應附帶的新 Nonce 以減少往返。
#[derive(Debug)]
pub struct Nonce {
    client: Client,
    url: String,
    pool: Mutex<Vec<String>>,
}

impl Nonce {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Nonce {
            client,
            url: url.into(),
            pool: Mutex::new(Vec::new()),
        }
    }

    fn fetch(&self) -> Result<String, NonceError> {
        let response = self.client.head(&self.url).send()?;

        match response.headers().get("Replay-Nonce") {
            Some(nonce) => Ok(nonce.to_str()?.to_string()),
            None => Err(NonceError::NoNonceHeader),
        }
    }
}

impl NonceT for Nonce {
    fn get(&self) -> Result<String, NonceError> {
        let cached = self.pool.lock().ok().and_then(|mut pool| pool.pop());
        match cached {
            Some(nonce) => Ok(nonce),
            None => self.fetch(),
        }
    }

    fn put(&self, nonce: String) {
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(nonce);
        }
    }
}

/// 固定回傳同一個 Nonce，供測試使用。
#[derive(Debug, Clone)]
pub struct MockNonce {
    value: String,
}

impl MockNonce {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl NonceT for MockNonce {
    fn get(&self) -> Result<String, NonceError> {
        Ok(self.value.clone())
    }
}
