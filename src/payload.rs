use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::base64::Base64;

/// 所有 ACME 請求載荷共用的序列化行為。
pub trait PayloadT: Serialize {
    fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 先序列化成 JSON，再以 Base64 編碼。
    fn to_base64(&self) -> Result<Base64, serde_json::Error> {
        let json_string = self.to_json_string()?;
        Ok(Base64::new(json_string.as_bytes()))
    }
}

/// 建立新帳戶所需的載荷。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountPayload {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
}

impl NewAccountPayload {
    /// 聯絡信箱會自動補上 `mailto:` 前綴，已包含則不重複補充。
    pub fn new<S: AsRef<str>>(emails: &[S], terms_of_service_agreed: bool) -> Self {
        let contact = emails
            .iter()
            .map(|email| {
                let email = email.as_ref();
                if email.starts_with("mailto:") {
                    email.to_string()
                } else {
                    format!("mailto:{}", email)
                }
            })
            .collect();

        NewAccountPayload {
            contact,
            terms_of_service_agreed,
        }
    }
}

impl PayloadT for NewAccountPayload {}

/// 憑證所涵蓋的識別項，本工具只使用 `dns` 類型。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Identifier {
            type_: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// 建立新訂單時所需的載荷。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
}

impl NewOrderPayload {
    pub fn new<S: AsRef<str>>(domains: &[S], not_after: Option<DateTime<Utc>>) -> Self {
        NewOrderPayload {
            identifiers: domains
                .iter()
                .map(|domain| Identifier::dns(domain.as_ref()))
                .collect(),
            not_after: not_after.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }

    pub fn domains(&self) -> Vec<String> {
        self.identifiers.iter().map(|i| i.value.clone()).collect()
    }
}

impl PayloadT for NewOrderPayload {}

/// 通知 CA 挑戰已就緒的空物件 `{}`。
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ChallengeValidationPayload {}

impl PayloadT for ChallengeValidationPayload {}

/// 最終化訂單時提交的 CSR（DER 的 base64url 編碼）。
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeOrderPayload {
    #[serde(rename = "csr")]
    csr_b64_str: String,
}

impl FinalizeOrderPayload {
    pub fn new(csr_der: &[u8]) -> Self {
        FinalizeOrderPayload {
            csr_b64_str: Base64::new(csr_der).base64_url(),
        }
    }
}

impl PayloadT for FinalizeOrderPayload {}
