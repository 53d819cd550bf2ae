use std::{collections::HashSet, result};

use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use thiserror::Error;

use crate::key_pair::{KeyError, KeyPair};

/// 用於描述建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Invalid CSR request: {0}")]
    Validation(String),
    #[error("CSR signing failed: {0}")]
    Signing(#[from] ErrorStack),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

type Result<T> = result::Result<T, CsrError>;

/// 已簽署的 CSR 及其專屬的憑證金鑰。
#[derive(Debug, Clone)]
pub struct SignedCsr {
    /// 憑證金鑰，與帳戶金鑰無關。
    pub key_pair: KeyPair,
    pub der: Vec<u8>,
}

impl SignedCsr {
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(X509Req::from_der(&self.der)?.to_pem()?)
    }
}

/// 檢查網域清單：不可為空、不可有空白名稱、不可重複。
pub(crate) fn validate_domains<S: AsRef<str>>(domains: &[S]) -> result::Result<(), String> {
    if domains.is_empty() {
        return Err("At least one domain is required".to_string());
    }
    let mut seen = HashSet::new();
    for domain in domains {
        let domain = domain.as_ref();
        if domain.trim().is_empty() {
            return Err("Domain names must not be empty".to_string());
        }
        if !seen.insert(domain.to_ascii_lowercase()) {
            return Err(format!("Duplicate domain: {}", domain));
        }
    }
    Ok(())
}

/// CSR 檔案可使用的副檔名。
pub const CSR_EXTENSIONS: [&str; 2] = [".csr", ".pem"];

/// 檢查 CSR 副本的保存路徑。
pub(crate) fn check_csr_path(path: &str) -> result::Result<(), String> {
    if CSR_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        Ok(())
    } else {
        Err(format!(
            "CSR file must end with one of {}: {}",
            CSR_EXTENSIONS.join(", "),
            path
        ))
    }
}

/// CSR 建構器。每次 [`CsrBuilder::build`] 都會產生一把新的憑證金鑰。
///
/// 主體 CN 為第一個網域，O 為組織名稱（若有），SAN 涵蓋所有網域。
#[derive(Debug, Clone, Copy)]
pub struct CsrBuilder {
    key_bits: u32,
}

impl Default for CsrBuilder {
    fn default() -> Self {
        Self {
            key_bits: KeyPair::DEFAULT_BITS,
        }
    }
}

impl CsrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定憑證金鑰長度，預設為 [`KeyPair::DEFAULT_BITS`]。
    ///
    /// # 參數
    ///
    /// * `bits` - RSA 金鑰位元數，低於 [`KeyPair::MIN_BITS`] 會在 [`CsrBuilder::build`] 時被拒絕。
    pub fn key_bits(mut self, bits: u32) -> Self {
        self.key_bits = bits;
        self
    }

    /// 產生新的憑證金鑰並簽署 CSR。
    ///
    /// # 參數
    ///
    /// * `domains` - 憑證涵蓋的網域，每個都會出現在 SAN 中且只出現一次。
    /// * `organization` - 主體的 O 欄位，`None` 或空字串時省略。
    ///
    /// # Errors
    ///
    /// 網域清單無效時回傳 [`CsrError::Validation`]；金鑰產生或簽署失敗時回傳
    /// [`CsrError::Key`] 或 [`CsrError::Signing`]。
    pub fn build<S: AsRef<str>>(&self, domains: &[S], organization: Option<&str>) -> Result<SignedCsr> {
        validate_domains(domains).map_err(CsrError::Validation)?;
        let key_pair = KeyPair::generate(self.key_bits)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, domains[0].as_ref())?;
        if let Some(org) = organization.filter(|o| !o.is_empty()) {
            name.append_entry_by_nid(Nid::ORGANIZATIONNAME, org)?;
        }
        let name = name.build();

        let mut req_builder = X509Req::builder()?;
        req_builder.set_subject_name(&name)?;

        let mut san_builder = SubjectAlternativeName::new();
        for domain in domains {
            san_builder.dns(domain.as_ref());
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(&key_pair.pri_key)?;
        req_builder.sign(&key_pair.pri_key, MessageDigest::sha256())?;

        let der = req_builder.build().to_der()?;
        tracing::debug!(
            domains = domains.len(),
            bits = self.key_bits,
            "Built certificate signing request"
        );
        Ok(SignedCsr { key_pair, der })
    }
}
