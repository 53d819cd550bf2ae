use openssl::{
    error::ErrorStack,
    pkey::{Id, PKey, Private, Public},
    rsa::Rsa,
    sha::sha256,
};
use thiserror::Error;

use crate::{
    base64::Base64,
    jwk::{Jwk, JwkError},
    storage::{Storage, StorageError},
};

/// 金鑰相關操作的錯誤列舉。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    Generation(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Malformed key material: {0}")]
    Parse(String),
    #[error("Invalid key path: {0}")]
    Validation(String),
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
}

type Result<T> = std::result::Result<T, KeyError>;

/// 一組 RSA 金鑰對。
///
/// 帳戶金鑰與憑證金鑰都使用此型別，但兩者永遠是不同的實例：
/// 帳戶金鑰一旦註冊就不可重新產生，憑證金鑰則每次下單都重新產生。
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub pri_key: PKey<Private>,
    pub pub_key: PKey<Public>,
}

impl KeyPair {
    /// 預設金鑰長度。
    pub const DEFAULT_BITS: u32 = 2048;
    /// 允許的最小金鑰長度，低於此值一律拒絕。
    pub const MIN_BITS: u32 = 2048;
    /// 金鑰檔案必須使用的副檔名。
    pub const FILE_EXTENSION: &'static str = ".pem";

    /// 產生新的 RSA 金鑰對。
    ///
    /// `bits` 小於 [`KeyPair::MIN_BITS`] 時回傳 [`KeyError::Generation`]。
    pub fn generate(bits: u32) -> Result<Self> {
        if bits < Self::MIN_BITS {
            return Err(KeyError::Generation(format!(
                "{} bits is below the minimum of {}",
                bits,
                Self::MIN_BITS
            )));
        }
        let rsa = Rsa::generate(bits).map_err(|e| KeyError::Generation(e.to_string()))?;
        let pri_key = PKey::from_rsa(rsa)?;
        let pub_key = Self::derive_public_key(&pri_key)?;
        Ok(Self { pri_key, pub_key })
    }

    /// 以 PEM 格式（PKCS#8 私鑰，後接公鑰）寫入 `path`。
    ///
    /// 路徑必須以 `.pem` 結尾，否則在碰觸儲存之前就回傳 [`KeyError::Validation`]。
    pub fn save(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        Self::check_path(path)?;
        storage.write_file(path, &self.to_pem()?)?;
        tracing::debug!(path, bits = self.bits(), "Saved key pair");
        Ok(())
    }

    /// 從 `path` 讀取 PEM 格式的金鑰對。
    pub fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let data = storage.read_file(path)?;
        Self::from_pem(&data)
    }

    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        let pri_key =
            PKey::private_key_from_pem(pri_key_pem).map_err(|e| KeyError::Parse(e.to_string()))?;
        if pri_key.id() != Id::RSA {
            return Err(KeyError::Parse("only RSA keys are supported".to_string()));
        }
        let pub_key = Self::derive_public_key(&pri_key)?;
        Ok(Self { pri_key, pub_key })
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        let mut pem = self.pri_key.private_key_to_pem_pkcs8()?;
        pem.extend_from_slice(&self.pub_key.public_key_to_pem()?);
        Ok(pem)
    }

    pub fn bits(&self) -> u32 {
        self.pri_key.bits()
    }

    /// 計算 RFC 7638 JWK 指紋，以 URL-safe Base64 回傳。
    pub fn thumbprint(&self) -> Result<String> {
        let jwk = Jwk::new(self)?;
        let hash = sha256(jwk.to_acme_json()?.as_bytes());
        Ok(Base64::new(hash).base64_url())
    }

    pub(crate) fn check_path(path: &str) -> Result<()> {
        if !path.ends_with(Self::FILE_EXTENSION) {
            return Err(KeyError::Validation(format!(
                "key pair file must end with {}: {}",
                Self::FILE_EXTENSION,
                path
            )));
        }
        Ok(())
    }

    fn derive_public_key(pri_key: &PKey<Private>) -> Result<PKey<Public>> {
        let rsa = pri_key.rsa()?;
        let pub_rsa = Rsa::from_public_components(rsa.n().to_owned()?, rsa.e().to_owned()?)?;
        Ok(PKey::from_rsa(pub_rsa)?)
    }
}
