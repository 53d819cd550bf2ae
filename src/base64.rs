use openssl::base64::{decode_block, encode_block};
use thiserror::Error;

/// Base64 解碼失敗時的錯誤。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid base64 input: {0}")]
    Invalid(String),
}

/// 以標準 Base64 保存編碼結果，並可轉為 ACME/JOSE 使用的 URL-safe（無填充）形式。
///
/// ```
/// # use acme_certgen::base64::Base64;
/// let b64 = Base64::new("Hello, World!");
/// assert_eq!(b64.as_str(), "SGVsbG8sIFdvcmxkIQ==");
/// assert_eq!(b64.base64_url(), "SGVsbG8sIFdvcmxkIQ");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64 {
    encoded: String,
}

impl Base64 {
    pub fn new<T: AsRef<[u8]>>(input: T) -> Self {
        let bytes = input.as_ref();
        let encoded = if bytes.is_empty() {
            String::new()
        } else {
            encode_block(bytes)
        };
        Self { encoded }
    }

    /// 從 URL-safe 且可能省略填充的字串建立實例。
    pub fn from_url(url_encoded: &str) -> Result<Self, DecodeError> {
        let mut encoded: String = url_encoded
            .chars()
            .map(|c| match c {
                '-' => '+',
                '_' => '/',
                c => c,
            })
            .collect();
        while encoded.len() % 4 != 0 {
            encoded.push('=');
        }
        let this = Self { encoded };
        this.decode()?;
        Ok(this)
    }

    pub fn decode(&self) -> Result<Vec<u8>, DecodeError> {
        if self.encoded.is_empty() {
            return Ok(Vec::new());
        }
        decode_block(&self.encoded).map_err(|e| DecodeError::Invalid(e.to_string()))
    }

    /// 回傳 RFC 7515 所要求的 base64url 編碼（不含 `=` 填充）。
    pub fn base64_url(&self) -> String {
        self.encoded
            .trim_end_matches('=')
            .chars()
            .map(|c| match c {
                '+' => '-',
                '/' => '_',
                c => c,
            })
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}
