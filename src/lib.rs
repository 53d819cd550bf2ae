//! # ACME HTTP-01 憑證簽發
//!
//! 本庫以 ACME 協議（RFC 8555）向 CA（例如 Let's Encrypt）自動申請網域憑證，
//! 只使用 HTTP-01 驗證。主要模組：
//!
//! - **key_pair**: RSA 金鑰對的產生、保存與載入。
//! - **account**: 建立或恢復 ACME 帳戶，location 持久化於 `.txt` 檔案。
//! - **challenge**: 發佈 HTTP-01 內容、通知 CA 並有限次地輪詢授權結果。
//! - **csr**: 產生憑證金鑰與 CSR。
//! - **order**: 編排整張訂單，從建立到取得憑證鏈。
//! - **certificate**: 下載、保存與檢查憑證鏈。
//!
//! 與 CA 的所有互動都經過 [`client::AcmeApi`]，正式環境使用 [`client::HttpClient`]。
//!
//! ## 使用方式
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use acme_certgen::{
//!     account::AccountRegistrar,
//!     client::HttpClient,
//!     directory::LETS_ENCRYPT_STAGING,
//!     order::{OrderOrchestrator, OrderSettings},
//!     poll::CancellationToken,
//!     publisher::WebrootPublisher,
//!     storage::FsStorage,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Arc::new(HttpClient::new(LETS_ENCRYPT_STAGING)?);
//!     let storage = Arc::new(FsStorage::new());
//!
//!     // 1. 建立或恢復帳戶
//!     let registrar = AccountRegistrar::new(client.as_ref(), storage.as_ref(), "account/location.txt");
//!     let key_pair = registrar.ensure_account_key("account/key.pem", 2048)?;
//!     let account = registrar.register_or_resume(key_pair, true)?;
//!
//!     // 2. 申請憑證，挑戰檔案寫入網站根目錄
//!     let settings = OrderSettings::new(&["example.com", "www.example.com"], "certs/chain.pem");
//!     let publisher = Arc::new(WebrootPublisher::new("/var/www/html"));
//!     let orchestrator = OrderOrchestrator::new(client, publisher, storage, settings);
//!     orchestrator.issue(&account, &CancellationToken::new())?;
//!
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod base64;
pub mod certificate;
pub mod challenge;
pub mod client;
pub mod config;
pub mod csr;
pub mod directory;
pub mod jwk;
pub mod jws;
pub mod key_pair;
pub mod nonce;
pub mod order;
pub mod payload;
pub mod poll;
pub mod protection;
pub mod publisher;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;
