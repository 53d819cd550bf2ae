//! 訂單編排：建立訂單、完成每個網域的授權、提交 CSR、等待簽發並下載憑證鏈。
//!
//! 任何一個網域的授權失敗都會中止整張訂單；只有在所有授權都重新確認為 valid 之後
//! 才會提交 CSR。所有輪詢都有總時限，且可以透過 [`CancellationToken`] 中斷。

use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    account::Account,
    certificate::{CertificateChain, CertificateDownloader, CertificateError},
    challenge::{Authorization, AuthorizationStatus, ChallengeError, ChallengeProcessor},
    client::{with_retries, AcmeApi, ApiError, Problem},
    csr::{check_csr_path, validate_domains, CsrBuilder, CsrError},
    key_pair::{KeyError, KeyPair},
    payload::NewOrderPayload,
    poll::{
        poll_until, CancellationToken, Clock, PollOutcome, PollPolicy, RetryPolicy, SystemClock,
    },
    publisher::ChallengePublisher,
    storage::{Storage, StorageError},
};

/// 定義所有訂單操作可能產生的錯誤。
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Invalid order request: {0}")]
    Validation(String),
    #[error("Authorization failed: {}", describe_failures(.failures))]
    AuthorizationFailed { failures: Vec<ChallengeError> },
    #[error("Order failed: {0}")]
    OrderFailed(String),
    #[error("Network error: {0}")]
    Network(#[source] ApiError),
    #[error("Unexpected CA response: {0}")]
    Api(#[source] ApiError),
    #[error("Invalid order state: {0}")]
    InvalidState(String),
    #[error("Timed out after {timeout:?} while {phase}")]
    TimedOut { phase: OrderPhase, timeout: Duration },
    #[error("Order was cancelled")]
    Cancelled,
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Key pair error: {0}")]
    KeyPair(#[from] KeyError),
}

impl From<ApiError> for OrderError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Rejected { problem, .. } => OrderError::OrderFailed(problem.to_string()),
            e if e.is_retryable() => OrderError::Network(e),
            e => OrderError::Api(e),
        }
    }
}

impl OrderError {
    /// 授權失敗的網域（其他錯誤回傳空清單）。
    pub fn failed_domains(&self) -> Vec<&str> {
        match self {
            OrderError::AuthorizationFailed { failures } => {
                failures.iter().map(ChallengeError::domain).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn describe_failures(failures: &[ChallengeError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

type Result<T> = std::result::Result<T, OrderError>;

/// 訂單狀態。除 `invalid` 外只能沿 pending → ready → processing → valid 前進。
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Ready => 1,
            Self::Processing => 2,
            Self::Valid => 3,
            Self::Invalid => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Valid | Self::Invalid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "processing" => Ok(Self::Processing),
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            _ => Err(OrderError::InvalidState(format!("Unknown order status: {}", s))),
        }
    }
}

/// CA 端的訂單。狀態只會透過 [`Order::refresh`] 或 [`Order::apply`] 改變。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub url: String,
    pub status: OrderStatus,
    pub expires: Option<String>,
    pub domains: Vec<String>,
    pub not_after: Option<String>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    pub certificate: Option<String>,
    pub error: Option<Problem>,
}

impl Order {
    /// 以 CA 的最新回應更新訂單。狀態倒退時回傳 [`OrderError::InvalidState`]。
    pub fn apply(&mut self, fresh: Order) -> Result<()> {
        if fresh.status.rank() < self.status.rank() {
            return Err(OrderError::InvalidState(format!(
                "Order {} moved from {} back to {}",
                self.url, self.status, fresh.status
            )));
        }
        if fresh.status != self.status {
            tracing::debug!(url = %self.url, from = %self.status, to = %fresh.status, "Order status changed");
        }
        self.status = fresh.status;
        self.expires = fresh.expires;
        self.not_after = fresh.not_after;
        if !fresh.domains.is_empty() {
            self.domains = fresh.domains;
        }
        if !fresh.authorizations.is_empty() {
            self.authorizations = fresh.authorizations;
        }
        if !fresh.finalize.is_empty() {
            self.finalize = fresh.finalize;
        }
        self.certificate = fresh.certificate.or(self.certificate.take());
        self.error = fresh.error;
        Ok(())
    }

    pub fn refresh(
        &mut self,
        api: &dyn AcmeApi,
        account: &Account,
        retry: &RetryPolicy,
    ) -> Result<()> {
        let fresh = with_retries(retry, "fetch order", || api.fetch_order(account, &self.url))?;
        self.apply(fresh)
    }

    fn failure_detail(&self) -> String {
        self.error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("order {} is invalid", self.url))
    }
}

/// 編排流程目前所在的階段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPhase {
    Created,
    Authorizing,
    Finalizing,
    PollingIssuance,
    Issued,
    Failed,
}

impl fmt::Display for OrderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "creating order",
            Self::Authorizing => "authorizing",
            Self::Finalizing => "finalizing",
            Self::PollingIssuance => "waiting for issuance",
            Self::Issued => "issued",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 一次簽發所需的全部設定。
#[derive(Debug, Clone)]
pub struct OrderSettings {
    pub domains: Vec<String>,
    pub organization: Option<String>,
    pub not_after: Option<DateTime<Utc>>,
    /// CSR 的 PEM 副本，僅供稽核。
    pub csr_path: Option<String>,
    pub certificate_key_path: Option<String>,
    pub chain_path: String,
    pub key_bits: u32,
    pub challenge_poll: PollPolicy,
    pub order_poll: PollPolicy,
    pub retry: RetryPolicy,
    /// 同時處理的授權數量，1 代表依序處理。
    pub concurrency: usize,
}

impl OrderSettings {
    /// 以預設的輪詢、重試與金鑰長度建立設定。
    ///
    /// # 參數
    ///
    /// - `domains`: 要放進同一張憑證的網域，第一個會成為 CN。
    /// - `chain_path`: 憑證鏈的保存路徑。
    ///
    /// 這裡不做檢查，錯誤會在 [`OrderSettings::validate`] 或簽發開始時回報。
    pub fn new<S: AsRef<str>>(domains: &[S], chain_path: impl Into<String>) -> Self {
        Self {
            domains: domains.iter().map(|d| d.as_ref().to_string()).collect(),
            organization: None,
            not_after: None,
            csr_path: None,
            certificate_key_path: None,
            chain_path: chain_path.into(),
            key_bits: KeyPair::DEFAULT_BITS,
            challenge_poll: PollPolicy::challenge_default(),
            order_poll: PollPolicy::order_default(),
            retry: RetryPolicy::default(),
            concurrency: 1,
        }
    }
}

impl OrderSettings {
    /// 在送出任何請求之前檢查設定。
    ///
    /// # Errors
    ///
    /// 網域清單無效、`key_bits` 低於 [`KeyPair::MIN_BITS`]、輸出路徑格式錯誤或
    /// `concurrency` 為 0 時回傳 [`OrderError::Validation`]。
    pub fn validate(&self) -> Result<()> {
        validate_domains(&self.domains).map_err(OrderError::Validation)?;
        if self.concurrency == 0 {
            return Err(OrderError::Validation("concurrency must be at least 1".to_string()));
        }
        if self.key_bits < KeyPair::MIN_BITS {
            return Err(OrderError::Validation(format!(
                "Certificate key of {} bits is below the minimum of {}",
                self.key_bits,
                KeyPair::MIN_BITS
            )));
        }
        if let Some(path) = &self.certificate_key_path {
            KeyPair::check_path(path).map_err(|e| OrderError::Validation(e.to_string()))?;
        }
        if let Some(path) = &self.csr_path {
            check_csr_path(path).map_err(OrderError::Validation)?;
        }
        if self.chain_path.trim().is_empty() {
            return Err(OrderError::Validation("Chain path must not be empty".to_string()));
        }
        Ok(())
    }
}

/// 簽發完成後的結果。
#[derive(Debug)]
pub struct IssuedCertificate {
    pub order: Order,
    pub chain: CertificateChain,
    /// CA 直接回傳已簽發的訂單時沒有本次產生的金鑰。
    pub certificate_key: Option<KeyPair>,
}

/// 驅動一張訂單從建立到取得憑證鏈。
#[derive(Debug)]
pub struct OrderOrchestrator {
    api: Arc<dyn AcmeApi>,
    publisher: Arc<dyn ChallengePublisher>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    settings: OrderSettings,
    phase: Mutex<OrderPhase>,
}

impl OrderOrchestrator {
    /// 建立編排器，預設使用系統時鐘。
    ///
    /// # 參數
    ///
    /// - `api`: 與 CA 溝通的傳輸層。
    /// - `publisher`: 放置 HTTP-01 挑戰內容的發佈端。
    /// - `storage`: 保存 CSR、憑證金鑰與憑證鏈。
    /// - `settings`: 本次簽發的設定。
    pub fn new(
        api: Arc<dyn AcmeApi>,
        publisher: Arc<dyn ChallengePublisher>,
        storage: Arc<dyn Storage>,
        settings: OrderSettings,
    ) -> Self {
        Self {
            api,
            publisher,
            storage,
            clock: Arc::new(SystemClock),
            settings,
            phase: Mutex::new(OrderPhase::Created),
        }
    }

    /// 替換輪詢使用的時鐘。
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &OrderSettings {
        &self.settings
    }

    pub fn phase(&self) -> OrderPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, phase: OrderPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        tracing::info!(%phase, "Order phase");
    }

    /// 執行完整的簽發流程。失敗時階段停在 [`OrderPhase::Failed`]。
    ///
    /// # Errors
    ///
    /// - 設定無效時回傳 [`OrderError::Validation`]，此時不會發出任何請求。
    /// - 任一授權失敗時回傳 [`OrderError::AuthorizationFailed`]，不會提交 CSR。
    /// - 輪詢超過時限或被取消時回傳 [`OrderError::TimedOut`] 或 [`OrderError::Cancelled`]。
    pub fn issue(&self, account: &Account, cancel: &CancellationToken) -> Result<IssuedCertificate> {
        let result = self.run(account, cancel);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Order failed");
            self.enter(OrderPhase::Failed);
        }
        result
    }

    fn run(&self, account: &Account, cancel: &CancellationToken) -> Result<IssuedCertificate> {
        let settings = &self.settings;
        settings.validate()?;

        self.enter(OrderPhase::Created);
        let payload = NewOrderPayload::new(&settings.domains, settings.not_after);
        let mut order = with_retries(&settings.retry, "new order", || {
            self.api.new_order(account, &payload)
        })?;
        tracing::info!(url = %order.url, status = %order.status, domains = ?order.domains, "Created order");
        if order.status == OrderStatus::Invalid {
            return Err(OrderError::OrderFailed(order.failure_detail()));
        }

        let mut certificate_key = None;
        if order.status != OrderStatus::Valid {
            self.enter(OrderPhase::Authorizing);
            self.authorize(account, &order, cancel)?;
            self.verify_authorizations(account, &order)?;
            self.wait_for(account, &mut order, OrderPhase::Authorizing, cancel, |s| {
                matches!(s, OrderStatus::Ready | OrderStatus::Processing | OrderStatus::Valid)
            })?;
        }

        if order.status == OrderStatus::Ready {
            self.enter(OrderPhase::Finalizing);
            certificate_key = Some(self.finalize(account, &mut order)?);
        }

        if order.status != OrderStatus::Valid {
            self.enter(OrderPhase::PollingIssuance);
            self.wait_for(account, &mut order, OrderPhase::PollingIssuance, cancel, |s| {
                s == OrderStatus::Valid
            })?;
        }
        if certificate_key.is_none() {
            tracing::warn!(url = %order.url, "Order was finalized elsewhere, certificate key is not available");
        }

        let downloader = CertificateDownloader::new(self.api.as_ref(), self.storage.as_ref())
            .retry(settings.retry);
        let chain = downloader.download(account, &order)?;
        downloader.persist(&chain, &settings.chain_path)?;
        self.enter(OrderPhase::Issued);

        Ok(IssuedCertificate {
            order,
            chain,
            certificate_key,
        })
    }

    fn fetch_authorizations(&self, account: &Account, order: &Order) -> Result<Vec<Authorization>> {
        order
            .authorizations
            .iter()
            .map(|url| {
                with_retries(&self.settings.retry, "fetch authorization", || {
                    self.api.fetch_authorization(account, url)
                })
                .map_err(OrderError::from)
            })
            .collect()
    }

    fn processor(&self) -> ChallengeProcessor<'_> {
        ChallengeProcessor::new(
            self.api.as_ref(),
            self.publisher.as_ref(),
            self.clock.as_ref(),
            self.settings.challenge_poll,
            self.settings.retry,
        )
    }

    fn authorize(&self, account: &Account, order: &Order, cancel: &CancellationToken) -> Result<()> {
        let pending: Vec<Authorization> = self
            .fetch_authorizations(account, order)?
            .into_iter()
            .filter(|authz| authz.status != AuthorizationStatus::Valid)
            .collect();
        if pending.is_empty() {
            tracing::debug!("All authorizations already valid");
            return Ok(());
        }

        let workers = self.settings.concurrency.min(pending.len());
        let failures = if workers <= 1 {
            self.authorize_sequential(account, pending, cancel)
        } else {
            self.authorize_concurrent(account, pending, workers, cancel)
        };

        if !failures.is_empty() {
            return Err(OrderError::AuthorizationFailed { failures });
        }
        if cancel.is_cancelled() {
            return Err(OrderError::Cancelled);
        }
        Ok(())
    }

    fn authorize_sequential(
        &self,
        account: &Account,
        pending: Vec<Authorization>,
        cancel: &CancellationToken,
    ) -> Vec<ChallengeError> {
        let processor = self.processor();
        for mut authz in pending {
            match processor.process(account, &mut authz, cancel) {
                Ok(_) => {}
                Err(ChallengeError::Cancelled { .. }) => break,
                Err(e) => return vec![e],
            }
        }
        Vec::new()
    }

    /// 以固定數量的工作執行緒處理授權。任一失敗會取消其餘工作。
    fn authorize_concurrent(
        &self,
        account: &Account,
        pending: Vec<Authorization>,
        workers: usize,
        cancel: &CancellationToken,
    ) -> Vec<ChallengeError> {
        let abort = cancel.child();
        let queue = Mutex::new(pending.into_iter());
        let failures = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    let processor = self.processor();
                    loop {
                        if abort.is_cancelled() {
                            break;
                        }
                        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                        let Some(mut authz) = next else {
                            break;
                        };
                        match processor.process(account, &mut authz, &abort) {
                            Ok(_) => {}
                            Err(ChallengeError::Cancelled { .. }) => break,
                            Err(e) => {
                                failures
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .push(e);
                                abort.cancel();
                                break;
                            }
                        }
                    }
                });
            }
        });

        failures.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// 提交 CSR 前重新取得每筆授權，確認全部為 valid。
    fn verify_authorizations(&self, account: &Account, order: &Order) -> Result<()> {
        let not_valid: Vec<String> = self
            .fetch_authorizations(account, order)?
            .into_iter()
            .filter(|authz| authz.status != AuthorizationStatus::Valid)
            .map(|authz| format!("{} is {:?}", authz.domain, authz.status))
            .collect();
        if not_valid.is_empty() {
            Ok(())
        } else {
            Err(OrderError::InvalidState(format!(
                "Authorizations not valid before finalization: {}",
                not_valid.join(", ")
            )))
        }
    }

    fn finalize(&self, account: &Account, order: &mut Order) -> Result<KeyPair> {
        let settings = &self.settings;
        let csr = CsrBuilder::new()
            .key_bits(settings.key_bits)
            .build(&settings.domains, settings.organization.as_deref())?;

        if let Some(path) = &settings.csr_path {
            self.storage.write_file(path, &csr.to_pem()?)?;
            tracing::debug!(path, "Saved CSR");
        }
        if let Some(path) = &settings.certificate_key_path {
            csr.key_pair.save(self.storage.as_ref(), path)?;
        }

        let fresh = with_retries(&settings.retry, "finalize order", || {
            self.api.finalize_order(account, &order.finalize, &csr.der)
        })?;
        order.apply(fresh)?;
        tracing::info!(url = %order.url, status = %order.status, "Submitted CSR");
        if order.status == OrderStatus::Invalid {
            return Err(OrderError::OrderFailed(order.failure_detail()));
        }
        Ok(csr.key_pair)
    }

    fn wait_for(
        &self,
        account: &Account,
        order: &mut Order,
        phase: OrderPhase,
        cancel: &CancellationToken,
        accept: impl Fn(OrderStatus) -> bool,
    ) -> Result<()> {
        if accept(order.status) {
            return Ok(());
        }
        let policy = self.settings.order_poll;
        let outcome = poll_until(&policy, self.clock.as_ref(), cancel, || {
            order.refresh(self.api.as_ref(), account, &self.settings.retry)?;
            if accept(order.status) {
                Ok(Some(()))
            } else if order.status == OrderStatus::Invalid {
                Err(OrderError::OrderFailed(order.failure_detail()))
            } else {
                Ok(None)
            }
        })?;

        match outcome {
            PollOutcome::Ready(()) => Ok(()),
            PollOutcome::TimedOut => Err(OrderError::TimedOut {
                phase,
                timeout: policy.timeout,
            }),
            PollOutcome::Cancelled => Err(OrderError::Cancelled),
        }
    }
}
