//! 與 CA 溝通的傳輸層。
//!
//! [`AcmeApi`] 是協議編排與 HTTP 傳輸之間的接縫：[`HttpClient`] 以 `reqwest` 的阻塞式
//! 客戶端實作 RFC 8555 的 JWS 請求，測試則可以替換成假的 CA。
//! 所有回應都轉換成明確的資料模型，狀態只在呼叫端主動刷新時才會改變。

use std::{fmt, sync::OnceLock};

use reqwest::{
    blocking::{Client, Response},
    header::{ACCEPT, CONTENT_TYPE, LOCATION},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    account::Account,
    base64::Base64,
    challenge::{Authorization, AuthorizationStatus, Challenge, ChallengeStatus, ChallengeType},
    directory::Directory,
    jwk::{Jwk, JwkError},
    jws::{Jws, JwsError},
    key_pair::{KeyError, KeyPair},
    nonce::{Nonce, NonceError, NonceT},
    order::{Order, OrderStatus},
    payload::{
        ChallengeValidationPayload, FinalizeOrderPayload, Identifier, NewAccountPayload,
        NewOrderPayload, PayloadT,
    },
    poll::RetryPolicy,
    protection::{Protection, ProtectionError, Signer},
};

const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";
const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// RFC 7807 problem document，CA 拒絕請求時回傳。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<Problem>,
}

impl Problem {
    pub fn new(type_: impl Into<String>, detail: impl Into<String>) -> Self {
        Problem {
            type_: type_.into(),
            detail: Some(detail.into()),
            ..Default::default()
        }
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.type_ == BAD_NONCE
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.type_, detail)?,
            None => write!(f, "{}", self.type_)?,
        }
        for sub in &self.subproblems {
            write!(f, "; {}", sub)?;
        }
        Ok(())
    }
}

/// 傳輸層錯誤。只有 [`ApiError::is_retryable`] 為真的錯誤會被自動重試。
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("CA rejected request ({status}): {problem}")]
    Rejected { status: u16, problem: Problem },
    #[error("Unexpected response: {0}")]
    Protocol(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    #[error("Protection error: {0}")]
    Protection(#[from] ProtectionError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if is_transport_error(&e) {
            ApiError::Network(e.to_string())
        } else {
            ApiError::Protocol(e.to_string())
        }
    }
}

/// 只有連線、逾時與送出請求時的失敗算是暫時性網路錯誤。
///
/// 回應本文無法讀取或解碼時，CA 可能已經處理了請求，不能再重送。
pub(crate) fn is_transport_error(e: &reqwest::Error) -> bool {
    if e.is_decode() || e.is_body() {
        return false;
    }
    e.is_connect() || e.is_timeout() || e.is_request()
}

impl From<NonceError> for ApiError {
    fn from(e: NonceError) -> Self {
        ApiError::Protection(ProtectionError::Nonce(e))
    }
}

impl ApiError {
    /// 網路錯誤與 `badNonce` 拒絕可以立即重試，其餘 CA 拒絕一律不重試。
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Rejected { problem, .. } => problem.is_bad_nonce(),
            ApiError::Protection(ProtectionError::Nonce(NonceError::RequestFailed(e))) => {
                is_transport_error(e)
            }
            _ => false,
        }
    }

    /// CA 回報的問題描述（若此錯誤來自 CA 拒絕）。
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            ApiError::Rejected { problem, .. } => Some(problem),
            _ => None,
        }
    }
}

/// 以 `policy` 允許的次數立即重試可重試的錯誤。
pub fn with_retries<T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: impl FnMut() -> Result<T, ApiError>,
) -> Result<T, ApiError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_retryable() && attempt < policy.max_network_retries => {
                attempt += 1;
                tracing::warn!(
                    operation,
                    attempt,
                    max = policy.max_network_retries,
                    error = %e,
                    "Transient error, retrying"
                );
            }
            result => return result,
        }
    }
}

/// `newAccount` 的回應。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountResource {
    pub location: String,
    pub status: String,
    /// `201 Created` 為新帳戶；`200 OK` 代表此金鑰早已註冊過。
    pub created: bool,
}

/// ACME CA 的操作集合。
pub trait AcmeApi: Send + Sync + fmt::Debug {
    fn directory(&self) -> Result<Directory, ApiError>;

    fn new_account(
        &self,
        key_pair: &KeyPair,
        payload: &NewAccountPayload,
    ) -> Result<AccountResource, ApiError>;

    fn new_order(&self, account: &Account, payload: &NewOrderPayload) -> Result<Order, ApiError>;

    fn fetch_order(&self, account: &Account, url: &str) -> Result<Order, ApiError>;

    fn fetch_authorization(&self, account: &Account, url: &str) -> Result<Authorization, ApiError>;

    /// 通知 CA 挑戰已就緒，回傳挑戰的最新狀態。
    fn trigger_challenge(
        &self,
        account: &Account,
        challenge: &Challenge,
    ) -> Result<ChallengeStatus, ApiError>;

    fn finalize_order(
        &self,
        account: &Account,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<Order, ApiError>;

    /// 下載 PEM 格式的憑證鏈（葉憑證在前），原樣回傳。
    fn download_certificate(&self, account: &Account, url: &str) -> Result<Vec<u8>, ApiError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    status: OrderStatus,
    expires: Option<String>,
    identifiers: Vec<Identifier>,
    not_after: Option<String>,
    #[serde(default)]
    authorizations: Vec<String>,
    finalize: String,
    certificate: Option<String>,
    error: Option<Problem>,
}

impl OrderResponse {
    fn into_order(self, url: String) -> Order {
        Order {
            url,
            status: self.status,
            expires: self.expires,
            domains: self.identifiers.into_iter().map(|i| i.value).collect(),
            not_after: self.not_after,
            authorizations: self.authorizations,
            finalize: self.finalize,
            certificate: self.certificate,
            error: self.error,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizationResponse {
    identifier: Identifier,
    status: AuthorizationStatus,
    expires: Option<String>,
    #[serde(default)]
    wildcard: bool,
    #[serde(default)]
    challenges: Vec<ChallengeResponse>,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    #[serde(rename = "type")]
    type_: String,
    url: String,
    status: ChallengeStatus,
    #[serde(default)]
    token: String,
    validated: Option<String>,
    error: Option<Problem>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    status: String,
}

/// 以 `reqwest` 阻塞式客戶端實作的 ACME 傳輸層。
///
/// 目錄與 nonce 端點在第一次使用時才取得，之後重複使用。
#[derive(Debug)]
pub struct HttpClient {
    client: Client,
    directory_url: String,
    directory: OnceLock<Directory>,
    nonce: OnceLock<Nonce>,
}

impl HttpClient {
    /// 建立指向 `directory_url` 的客戶端。
    ///
    /// # 參數
    ///
    /// * `directory_url` - ACME 目錄的網址，例如 [`crate::directory::LETS_ENCRYPT_STAGING`]
    ///
    /// # Errors
    ///
    /// 無法建立底層 HTTP 客戶端（例如 TLS 後端初始化失敗）時回傳錯誤。
    /// 此時不會發出任何請求。
    pub fn new(directory_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            directory_url: directory_url.into(),
            directory: OnceLock::new(),
            nonce: OnceLock::new(),
        })
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    fn cached_directory(&self) -> Result<&Directory, ApiError> {
        if let Some(directory) = self.directory.get() {
            return Ok(directory);
        }
        tracing::debug!(url = %self.directory_url, "Fetching ACME directory");
        let response = self.client.get(&self.directory_url).send()?;
        if !response.status().is_success() {
            return Err(Self::rejection(response));
        }
        let directory: Directory = response.json()?;
        Ok(self.directory.get_or_init(|| directory))
    }

    fn nonce(&self) -> Result<&Nonce, ApiError> {
        if let Some(nonce) = self.nonce.get() {
            return Ok(nonce);
        }
        let url = self.cached_directory()?.new_nonce.clone();
        Ok(self
            .nonce
            .get_or_init(|| Nonce::new(self.client.clone(), url)))
    }

    fn post(
        &self,
        url: &str,
        key_pair: &KeyPair,
        signer: Signer<'_>,
        payload: &Base64,
        accept: &str,
    ) -> Result<Response, ApiError> {
        let nonce = self.nonce()?;
        let header = Protection::new(nonce, signer)
            .create_header(url)?
            .to_base64()?;
        let jws = Jws::sign(&header, payload, key_pair)?;

        tracing::trace!(url, "POST");
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, JOSE_JSON)
            .header(ACCEPT, accept)
            .body(jws.to_json()?)
            .send()?;

        if let Some(fresh) = response
            .headers()
            .get("Replay-Nonce")
            .and_then(|v| v.to_str().ok())
        {
            nonce.put(fresh.to_string());
        }

        if !response.status().is_success() {
            return Err(Self::rejection(response));
        }
        Ok(response)
    }

    fn post_as_account(
        &self,
        account: &Account,
        url: &str,
        payload: &Base64,
    ) -> Result<Response, ApiError> {
        self.post(
            url,
            &account.key_pair,
            Signer::Kid(&account.location),
            payload,
            "application/json",
        )
    }

    fn rejection(response: Response) -> ApiError {
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        let problem = serde_json::from_str::<Problem>(&body)
            .unwrap_or_else(|_| Problem::new("about:blank", body));
        ApiError::Rejected { status, problem }
    }

    fn location(response: &Response) -> Result<String, ApiError> {
        response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| ApiError::Protocol("Location header not found".to_string()))?
            .to_str()
            .map(ToString::to_string)
            .map_err(|e| ApiError::Protocol(e.to_string()))
    }

    fn parse_authorization(
        account: &Account,
        url: &str,
        response: AuthorizationResponse,
    ) -> Result<Authorization, ApiError> {
        let thumbprint = account.key_pair.thumbprint()?;
        let domain = if response.wildcard {
            format!("*.{}", response.identifier.value)
        } else {
            response.identifier.value
        };
        let challenges = response
            .challenges
            .into_iter()
            .map(|c| Challenge {
                challenge_type: ChallengeType::from_wire(&c.type_),
                key_authorization: format!("{}.{}", c.token, thumbprint),
                url: c.url,
                token: c.token,
                status: c.status,
                validated: c.validated,
                error: c.error,
            })
            .collect();

        Ok(Authorization {
            url: url.to_string(),
            domain,
            status: response.status,
            expires: response.expires,
            wildcard: response.wildcard,
            challenges,
        })
    }
}

impl AcmeApi for HttpClient {
    fn directory(&self) -> Result<Directory, ApiError> {
        self.cached_directory().cloned()
    }

    fn new_account(
        &self,
        key_pair: &KeyPair,
        payload: &NewAccountPayload,
    ) -> Result<AccountResource, ApiError> {
        let url = self.cached_directory()?.new_account.clone();
        let jwk = Jwk::new(key_pair)?;
        let response = self.post(
            &url,
            key_pair,
            Signer::Jwk(&jwk),
            &payload.to_base64()?,
            "application/json",
        )?;
        let created = response.status() == StatusCode::CREATED;
        let location = Self::location(&response)?;
        let account: AccountResponse = response.json()?;
        Ok(AccountResource {
            location,
            status: account.status,
            created,
        })
    }

    fn new_order(&self, account: &Account, payload: &NewOrderPayload) -> Result<Order, ApiError> {
        let url = self.cached_directory()?.new_order.clone();
        let response = self.post_as_account(account, &url, &payload.to_base64()?)?;
        let location = Self::location(&response)?;
        let order: OrderResponse = response.json()?;
        Ok(order.into_order(location))
    }

    fn fetch_order(&self, account: &Account, url: &str) -> Result<Order, ApiError> {
        let response = self.post_as_account(account, url, &Base64::new(b""))?;
        let order: OrderResponse = response.json()?;
        Ok(order.into_order(url.to_string()))
    }

    fn fetch_authorization(&self, account: &Account, url: &str) -> Result<Authorization, ApiError> {
        let response = self.post_as_account(account, url, &Base64::new(b""))?;
        let authorization: AuthorizationResponse = response.json()?;
        Self::parse_authorization(account, url, authorization)
    }

    fn trigger_challenge(
        &self,
        account: &Account,
        challenge: &Challenge,
    ) -> Result<ChallengeStatus, ApiError> {
        let payload = ChallengeValidationPayload::default().to_base64()?;
        let response = self.post_as_account(account, &challenge.url, &payload)?;
        let updated: ChallengeResponse = response.json()?;
        Ok(updated.status)
    }

    fn finalize_order(
        &self,
        account: &Account,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<Order, ApiError> {
        let payload = FinalizeOrderPayload::new(csr_der).to_base64()?;
        let response = self.post_as_account(account, finalize_url, &payload)?;
        let location = Self::location(&response).unwrap_or_default();
        let order: OrderResponse = response.json()?;
        Ok(order.into_order(location))
    }

    fn download_certificate(&self, account: &Account, url: &str) -> Result<Vec<u8>, ApiError> {
        let response = self.post(
            url,
            &account.key_pair,
            Signer::Kid(&account.location),
            &Base64::new(b""),
            PEM_CHAIN,
        )?;
        Ok(response.bytes()?.to_vec())
    }
}
