use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{base64::Base64, key_pair::KeyPair};

/// JWK 產生與序列化過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum JwkError {
    #[error("Failed to convert key: {0}")]
    KeyConversionError(#[from] openssl::error::ErrorStack),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// JSON Web Key (JWK)，僅支援 RSA 公鑰。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa(RsaJwk),
}

/// RSA 公鑰參數。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RsaJwk {
    n: String,
    e: String,
}

impl Jwk {
    pub fn new(key_pair: &KeyPair) -> Result<Self, JwkError> {
        let rsa = key_pair.pub_key.rsa()?;
        Ok(Jwk::Rsa(RsaJwk {
            n: Base64::new(rsa.n().to_vec()).base64_url(),
            e: Base64::new(rsa.e().to_vec()).base64_url(),
        }))
    }

    /// RFC 7638 指紋計算所需的正規化 JSON：只含必要欄位，且依字典序排列。
    pub fn to_acme_json(&self) -> Result<String, JwkError> {
        let Jwk::Rsa(jwk) = self;
        let mut map = Map::new();
        map.insert("e".to_string(), Value::String(jwk.e.clone()));
        map.insert("kty".to_string(), Value::String("RSA".to_string()));
        map.insert("n".to_string(), Value::String(jwk.n.clone()));

        serde_json::to_string(&Value::Object(map)).map_err(JwkError::from)
    }

    pub fn to_value(&self) -> Result<Value, JwkError> {
        Ok(serde_json::to_value(self)?)
    }
}
