use chrono::Utc;
use openssl::{asn1::Asn1Time, error::ErrorStack, x509::X509};
use thiserror::Error;

use crate::{
    account::Account,
    client::{with_retries, AcmeApi, ApiError},
    order::{Order, OrderStatus},
    poll::RetryPolicy,
    storage::{Storage, StorageError},
};

/// 證書相關操作可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Failed to parse certificate chain: {0}")]
    Parse(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Network error: {0}")]
    Network(#[source] ApiError),
    #[error("Certificate download rejected: {0}")]
    Api(#[source] ApiError),
}

impl From<ErrorStack> for CertificateError {
    fn from(e: ErrorStack) -> Self {
        CertificateError::Parse(e.to_string())
    }
}

impl From<ApiError> for CertificateError {
    fn from(e: ApiError) -> Self {
        if e.is_retryable() {
            CertificateError::Network(e)
        } else {
            CertificateError::Api(e)
        }
    }
}

type Result<T> = std::result::Result<T, CertificateError>;

/// CA 回傳的憑證鏈，葉憑證在前。
///
/// 保留 CA 回傳的原始位元組，寫入檔案時不做任何轉換。只能透過
/// [`CertificateChain::from_pem`] 建立，因此至少含有一張憑證。
#[derive(Debug, Clone)]
pub struct CertificateChain {
    pem: Vec<u8>,
    certs: Vec<X509>,
}

impl CertificateChain {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        if pem.iter().all(u8::is_ascii_whitespace) {
            return Err(CertificateError::Parse(
                "empty certificate chain".to_string(),
            ));
        }
        let certs = X509::stack_from_pem(pem)?;
        if certs.is_empty() {
            return Err(CertificateError::Parse(
                "no certificates found in PEM data".to_string(),
            ));
        }
        Ok(Self {
            pem: pem.to_vec(),
            certs,
        })
    }

    /// CA 回傳的原始 PEM。
    pub fn pem(&self) -> &[u8] {
        &self.pem
    }

    pub fn certs(&self) -> &[X509] {
        &self.certs
    }

    pub fn leaf(&self) -> &X509 {
        &self.certs[0]
    }

    /// 葉憑證 SAN 中的 DNS 名稱。
    pub fn leaf_dns_names(&self) -> Vec<String> {
        self.leaf()
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.dnsname().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 葉憑證剩餘的有效天數，已過期時為負值。
    pub fn days_remaining(&self) -> Result<i64> {
        let now = Asn1Time::from_unix(Utc::now().timestamp())?;
        let diff = now.diff(self.leaf().not_after())?;
        Ok(diff.days as i64 + (diff.secs as i64) / 86400)
    }

    /// 判斷證書是否應該進行續約
    ///
    /// 剩餘有效天數低於 `threshold_days`（或已過期）時回傳 `true`。
    pub fn should_renew(&self, threshold_days: u32) -> Result<bool> {
        let remaining = self.days_remaining()?;
        tracing::debug!(remaining, threshold_days, "Checked certificate expiry");
        Ok(remaining < threshold_days as i64)
    }
}

/// 取回並保存已簽發的憑證鏈。
#[derive(Debug)]
pub struct CertificateDownloader<'a> {
    api: &'a dyn AcmeApi,
    storage: &'a dyn Storage,
    retry: RetryPolicy,
}

impl<'a> CertificateDownloader<'a> {
    pub fn new(api: &'a dyn AcmeApi, storage: &'a dyn Storage) -> Self {
        Self {
            api,
            storage,
            retry: RetryPolicy::default(),
        }
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 下載訂單的憑證鏈。
    ///
    /// # Errors
    ///
    /// 訂單不是 valid 或沒有憑證 URL 時回傳 [`CertificateError::InvalidState`]，
    /// 且不會發出請求；回應無法解析時回傳 [`CertificateError::Parse`]。
    pub fn download(&self, account: &Account, order: &Order) -> Result<CertificateChain> {
        if order.status != OrderStatus::Valid {
            return Err(CertificateError::InvalidState(format!(
                "order {} is {}, not valid",
                order.url, order.status
            )));
        }
        let url = order.certificate.as_deref().ok_or_else(|| {
            CertificateError::InvalidState(format!("order {} has no certificate URL", order.url))
        })?;

        let pem = with_retries(&self.retry, "download certificate", || {
            self.api.download_certificate(account, url)
        })?;
        let chain = CertificateChain::from_pem(&pem)?;
        tracing::info!(url, certificates = chain.certs().len(), "Downloaded certificate chain");
        Ok(chain)
    }

    /// 原樣寫入憑證鏈。
    pub fn persist(&self, chain: &CertificateChain, path: &str) -> Result<()> {
        self.storage.write_file(path, chain.pem())?;
        tracing::info!(path, "Saved certificate chain");
        Ok(())
    }
}
