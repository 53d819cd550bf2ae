use crate::{
    base64::Base64,
    jwk::{Jwk, JwkError},
    nonce::{NonceError, NonceT},
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// 定義保護頭生成過程中可能產生的錯誤類型。
#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
}

type Result<T> = std::result::Result<T, ProtectionError>;

/// 請求者身分：建立帳戶時附上完整公鑰，其餘請求以帳戶 URL 作為 `kid`。
#[derive(Debug, Clone)]
pub enum Signer<'a> {
    Jwk(&'a Jwk),
    Kid(&'a str),
}

/// 用於生成 JWS 保護頭（Protected Header）的建構器。
pub struct Protection<'a> {
    nonce: &'a dyn NonceT,
    signer: Signer<'a>,
}

/// JWS 保護頭，只會帶有 `jwk` 與 `kid` 其中之一。
#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    alg: &'static str,
    nonce: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    pub fn to_base64(&self) -> Result<Base64> {
        Ok(Base64::new(serde_json::to_vec(self)?))
    }
}

impl<'a> Protection<'a> {
    /// 目前僅支援 RSA 金鑰，因此固定使用 `RS256`。
    pub const ALG: &'static str = "RS256";

    pub fn new(nonce: &'a dyn NonceT, signer: Signer<'a>) -> Self {
        Self { nonce, signer }
    }

    /// 取得新的 nonce 並生成指向 `url` 的保護頭。
    pub fn create_header(&self, url: impl Into<String>) -> Result<ProtectedHeader> {
        let nonce = self.nonce.get()?;
        let (jwk, kid) = match &self.signer {
            Signer::Jwk(jwk) => (Some(jwk.to_value()?), None),
            Signer::Kid(kid) => (None, Some(kid.to_string())),
        };

        Ok(ProtectedHeader {
            alg: Self::ALG,
            nonce,
            url: url.into(),
            jwk,
            kid,
        })
    }
}
