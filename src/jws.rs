//! JSON Web Signature (JWS) 的組裝與 RS256 簽名。

use std::result;

use openssl::{hash::MessageDigest, sign::Signer};
use serde::Serialize;
use thiserror::Error;

use crate::{base64::Base64, key_pair::KeyPair};

/// 扁平 JSON 序列化形式的 JWS，欄位皆為 base64url 字串。
#[derive(Serialize, Debug)]
pub struct Jws {
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

#[derive(Error, Debug)]
pub enum JwsError {
    #[error("Signing error: {0}")]
    Signing(#[from] openssl::error::ErrorStack),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = result::Result<T, JwsError>;

impl Jws {
    /// 以 `key_pair` 對 `header.payload` 簽名並組成 JWS。
    ///
    /// payload 為空字串時即為 ACME 的 POST-as-GET 請求。
    pub fn sign(header_b64: &Base64, payload_b64: &Base64, key_pair: &KeyPair) -> Result<Self> {
        let header = header_b64.base64_url();
        let payload = payload_b64.base64_url();
        let signing_input = format!("{}.{}", header, payload);

        let mut signer = Signer::new(MessageDigest::sha256(), &key_pair.pri_key)?;
        signer.update(signing_input.as_bytes())?;
        let signature = Base64::new(signer.sign_to_vec()?).base64_url();

        Ok(Jws {
            header,
            payload,
            signature,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
