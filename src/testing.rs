//! 測試用的假 CA、手動時鐘與可記錄的發佈端。

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    time::{Duration, Instant},
};

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private, Public},
    rsa::Rsa,
    stack::Stack,
    x509::{
        extension::SubjectAlternativeName, X509Builder, X509Extension, X509NameBuilder, X509Ref,
        X509Req, X509,
    },
};

use crate::{
    account::Account,
    challenge::{Authorization, AuthorizationStatus, Challenge, ChallengeStatus, ChallengeType},
    client::{AccountResource, AcmeApi, ApiError, Problem},
    directory::{Directory, DirectoryMeta},
    key_pair::KeyPair,
    order::{Order, OrderStatus},
    payload::{NewAccountPayload, NewOrderPayload},
    poll::{CancellationToken, Clock},
    publisher::{ChallengePublisher, MemPublisher, PublishError},
};

const BASE: &str = "https://fake-ca.test";

/// 只在 `sleep` 時前進的時鐘。
#[derive(Debug)]
pub(crate) struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += duration;
        !cancel.is_cancelled()
    }
}

/// 記錄每次發佈的 [`MemPublisher`]。複本之間共用狀態。
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingPublisher {
    inner: MemPublisher,
    published: Arc<Mutex<Vec<String>>>,
}

impl RecordingPublisher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish_count(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn get(&self, token: &str) -> Option<String> {
        self.inner.get(token)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl ChallengePublisher for RecordingPublisher {
    fn publish(&self, token: &str, content: &str) -> Result<(), PublishError> {
        self.inner.publish(token, content)?;
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token.to_string());
        Ok(())
    }

    fn unpublish(&self, token: &str) -> Result<(), PublishError> {
        self.inner.unpublish(token)
    }
}

/// 測試共用的帳戶金鑰，避免每個測試都產生 RSA 金鑰。
pub(crate) fn test_key() -> KeyPair {
    static KEY: OnceLock<KeyPair> = OnceLock::new();
    KEY.get_or_init(|| KeyPair::generate(2048).unwrap()).clone()
}

pub(crate) fn test_account(ca: &FakeCa) -> Account {
    let key_pair = test_key();
    let location = ca.register(&key_pair);
    Account { key_pair, location }
}

fn ca_material() -> &'static (PKey<Private>, X509) {
    static CA: OnceLock<(PKey<Private>, X509)> = OnceLock::new();
    CA.get_or_init(|| {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let public = public_key(&key);
        let cert = build_certificate(&public, "Fake Test CA", &[], 365, None, &key, None).unwrap();
        (key, cert)
    })
}

fn public_key(key: &PKey<Private>) -> PKey<Public> {
    PKey::public_key_from_pem(&key.public_key_to_pem().unwrap()).unwrap()
}

fn build_certificate(
    public_key: &PKey<Public>,
    common_name: &str,
    dns_names: &[String],
    days: u32,
    issuer: Option<&X509>,
    signing_key: &PKey<Private>,
    requested: Option<&Stack<X509Extension>>,
) -> Result<X509, ErrorStack> {
    static SERIAL: AtomicU32 = AtomicU32::new(1);

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = name.build();
    let issuer: Option<&X509Ref> = issuer.map(|c| &**c);

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(SERIAL.fetch_add(1, Ordering::Relaxed))?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(issuer.map(|c| c.subject_name()).unwrap_or(&*name))?;
    builder.set_pubkey(public_key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    if !dns_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for dns in dns_names {
            san.dns(dns);
        }
        let extension = san.build(&builder.x509v3_context(issuer, None))?;
        builder.append_extension(extension)?;
    }
    if let Some(requested) = requested {
        for extension in requested.iter() {
            builder.append_extension2(extension)?;
        }
    }
    builder.sign(signing_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// 憑證 SAN 中的所有 DNS 名稱，依出現順序。
pub(crate) fn leaf_dns_names(cert: &X509Ref) -> Vec<String> {
    cert.subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.dnsname().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// 以測試 CA 簽署 `req`，憑證只帶 CSR 自己要求的擴充欄位。
pub(crate) fn sign_request(req: &X509Req) -> X509 {
    let (ca_key, ca_cert) = ca_material();
    let extensions = req.extensions().unwrap();
    build_certificate(
        &req.public_key().unwrap(),
        "csr-under-test",
        &[],
        1,
        Some(ca_cert),
        ca_key,
        Some(&extensions),
    )
    .unwrap()
}

/// 產生一張有效 `days` 天的 PEM 憑證；名稱含 `.` 時也會放進 SAN。
pub(crate) fn self_signed_pem(common_name: &str, days: u32) -> Vec<u8> {
    let (key, _) = ca_material();
    let dns: Vec<String> = if common_name.contains('.') {
        vec![common_name.to_string()]
    } else {
        Vec::new()
    };
    build_certificate(&public_key(key), common_name, &dns, days, None, key, None)
        .unwrap()
        .to_pem()
        .unwrap()
}

/// 假 CA 對單一網域授權的反應。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Behavior {
    /// 觸發後第 n 次查詢變成 valid。
    ValidAfter(u32),
    AlreadyValid,
    /// 觸發後變成 invalid，並附上原因。
    Invalid(String),
    NeverResolves,
    /// 只提供 dns-01 挑戰。
    DnsOnly,
}

/// 各端點被成功呼叫的次數。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Stats {
    pub directory: u32,
    pub new_account: u32,
    pub new_order: u32,
    pub order_fetches: u32,
    pub authorization_fetches: u32,
    pub triggers: u32,
    pub finalizes: u32,
    pub downloads: u32,
}

#[derive(Debug)]
struct AuthzEntry {
    domain: String,
    behavior: Behavior,
    status: AuthorizationStatus,
    challenge_status: ChallengeStatus,
    token: String,
    fetches_since_trigger: u32,
    error: Option<Problem>,
}

#[derive(Debug)]
struct OrderEntry {
    order: Order,
    issuance_polls: u32,
}

#[derive(Debug, Default)]
struct State {
    stats: Stats,
    behaviors: HashMap<String, Behavior>,
    terms: Option<String>,
    accounts: HashMap<String, String>,
    authzs: HashMap<String, AuthzEntry>,
    orders: HashMap<String, OrderEntry>,
    certificates: HashMap<String, Vec<u8>>,
    fail_next: u32,
    next_id: u32,
    issuance_delay: u32,
    issuance_failure: Option<String>,
    last_chain: Option<Vec<u8>>,
    watched: Option<RecordingPublisher>,
}

impl State {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn fail_point(&mut self) -> Result<(), ApiError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(ApiError::Network("connection reset by fake CA".to_string()));
        }
        Ok(())
    }

    fn create_authz(&mut self, domain: &str) -> String {
        let id = self.next_id();
        let behavior = self
            .behaviors
            .get(domain)
            .cloned()
            .unwrap_or(Behavior::ValidAfter(1));
        let valid = behavior == Behavior::AlreadyValid;
        let url = format!("{}/authz/{}", BASE, id);
        self.authzs.insert(
            url.clone(),
            AuthzEntry {
                domain: domain.to_string(),
                behavior,
                status: if valid {
                    AuthorizationStatus::Valid
                } else {
                    AuthorizationStatus::Pending
                },
                challenge_status: if valid {
                    ChallengeStatus::Valid
                } else {
                    ChallengeStatus::Pending
                },
                token: format!("token-{}", id),
                fetches_since_trigger: 0,
                error: None,
            },
        );
        url
    }
}

fn not_found(url: &str) -> ApiError {
    ApiError::Rejected {
        status: 404,
        problem: Problem::new("urn:ietf:params:acme:error:malformed", format!("{} not found", url)),
    }
}

fn authz_view(url: &str, entry: &AuthzEntry, thumbprint: &str) -> Authorization {
    let challenge = |challenge_type: ChallengeType, error: Option<Problem>| Challenge {
        url: format!("{}/{}", url, challenge_type.as_str()),
        challenge_type,
        token: entry.token.clone(),
        status: entry.challenge_status,
        key_authorization: format!("{}.{}", entry.token, thumbprint),
        validated: None,
        error,
    };
    let challenges = if entry.behavior == Behavior::DnsOnly {
        vec![challenge(ChallengeType::Dns01, None)]
    } else {
        vec![
            challenge(ChallengeType::Http01, entry.error.clone()),
            challenge(ChallengeType::Dns01, None),
        ]
    };
    Authorization {
        url: url.to_string(),
        domain: entry.domain.clone(),
        status: entry.status,
        expires: Some("2099-01-01T00:00:00Z".to_string()),
        wildcard: false,
        challenges,
    }
}

/// 在記憶體中模擬 ACME CA 的行為，並以真正的 X.509 憑證回應簽發。
#[derive(Debug)]
pub(crate) struct FakeCa {
    state: Mutex<State>,
}

impl FakeCa {
    pub(crate) fn new() -> Self {
        let state = State {
            terms: Some(format!("{}/terms", BASE)),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_behavior(&self, domain: &str, behavior: Behavior) {
        self.lock().behaviors.insert(domain.to_string(), behavior);
    }

    pub(crate) fn set_terms(&self, terms: Option<&str>) {
        self.lock().terms = terms.map(ToString::to_string);
    }

    /// 接下來 `n` 個請求以網路錯誤失敗。
    pub(crate) fn fail_next_requests(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// 提交 CSR 後需要查詢幾次訂單才會變成 valid。
    pub(crate) fn set_issuance_delay(&self, polls: u32) {
        self.lock().issuance_delay = polls;
    }

    pub(crate) fn fail_issuance(&self, reason: &str) {
        self.lock().issuance_failure = Some(reason.to_string());
    }

    /// 觸發挑戰時檢查內容是否已發佈，未發佈則判定授權失敗。
    pub(crate) fn watch_publisher(&self, publisher: RecordingPublisher) {
        self.lock().watched = Some(publisher);
    }

    pub(crate) fn stats(&self) -> Stats {
        self.lock().stats.clone()
    }

    pub(crate) fn issued_chain(&self) -> Option<Vec<u8>> {
        self.lock().last_chain.clone()
    }

    /// 直接登記帳戶，不計入統計。
    pub(crate) fn register(&self, key_pair: &KeyPair) -> String {
        let thumbprint = key_pair.thumbprint().unwrap();
        let mut state = self.lock();
        if let Some(location) = state.accounts.get(&thumbprint) {
            return location.clone();
        }
        let location = format!("{}/acct/{}", BASE, state.next_id());
        state.accounts.insert(thumbprint, location.clone());
        location
    }

    /// 為單一網域建立獨立的授權，供挑戰流程測試使用。
    pub(crate) fn authorization_for(&self, account: &Account, domain: &str) -> Authorization {
        let thumbprint = account.key_pair.thumbprint().unwrap();
        let mut state = self.lock();
        let url = state.create_authz(domain);
        authz_view(&url, &state.authzs[&url], &thumbprint)
    }

    fn issue_certificate(order: &Order, csr_der: &[u8]) -> Result<Vec<u8>, ApiError> {
        let protocol = |e: ErrorStack| ApiError::Protocol(e.to_string());
        let req = X509Req::from_der(csr_der).map_err(protocol)?;
        let public = req.public_key().map_err(protocol)?;
        if !req.verify(&public).map_err(protocol)? {
            return Err(ApiError::Rejected {
                status: 400,
                problem: Problem::new("urn:ietf:params:acme:error:badCSR", "bad signature"),
            });
        }
        // 如同真正的 CA，SAN 取自 CSR，並且必須與訂單的識別碼完全一致
        let extensions = req.extensions().map_err(protocol)?;
        let (ca_key, ca_cert) = ca_material();
        let leaf = build_certificate(
            &public,
            &order.domains[0],
            &[],
            90,
            Some(ca_cert),
            ca_key,
            Some(&extensions),
        )
        .map_err(protocol)?;

        let mut requested = leaf_dns_names(&leaf);
        let mut expected = order.domains.clone();
        requested.sort();
        expected.sort();
        if requested != expected {
            return Err(ApiError::Rejected {
                status: 400,
                problem: Problem::new(
                    "urn:ietf:params:acme:error:badCSR",
                    format!("CSR names {:?} do not match order {:?}", requested, expected),
                ),
            });
        }
        let mut chain = leaf.to_pem().map_err(protocol)?;
        chain.extend(ca_cert.to_pem().map_err(protocol)?);
        Ok(chain)
    }
}

impl AcmeApi for FakeCa {
    fn directory(&self) -> Result<Directory, ApiError> {
        let mut state = self.lock();
        state.fail_point()?;
        state.stats.directory += 1;
        Ok(Directory {
            new_nonce: format!("{}/new-nonce", BASE),
            new_account: format!("{}/new-acct", BASE),
            new_order: format!("{}/new-order", BASE),
            revoke_cert: None,
            key_change: None,
            renewal_info: None,
            meta: Some(DirectoryMeta {
                terms_of_service: state.terms.clone(),
                ..Default::default()
            }),
        })
    }

    fn new_account(
        &self,
        key_pair: &KeyPair,
        payload: &NewAccountPayload,
    ) -> Result<AccountResource, ApiError> {
        let thumbprint = key_pair.thumbprint()?;
        let mut state = self.lock();
        state.fail_point()?;
        state.stats.new_account += 1;
        if state.terms.is_some() && !payload.terms_of_service_agreed {
            return Err(ApiError::Rejected {
                status: 403,
                problem: Problem::new(
                    "urn:ietf:params:acme:error:userActionRequired",
                    "terms of service must be agreed",
                ),
            });
        }
        let (location, created) = match state.accounts.get(&thumbprint) {
            Some(location) => (location.clone(), false),
            None => {
                let location = format!("{}/acct/{}", BASE, state.next_id());
                state.accounts.insert(thumbprint, location.clone());
                (location, true)
            }
        };
        Ok(AccountResource {
            location,
            status: "valid".to_string(),
            created,
        })
    }

    fn new_order(&self, _account: &Account, payload: &NewOrderPayload) -> Result<Order, ApiError> {
        let mut state = self.lock();
        state.fail_point()?;
        state.stats.new_order += 1;
        let domains = payload.domains();
        let authorizations: Vec<String> = domains.iter().map(|d| state.create_authz(d)).collect();
        let all_valid = authorizations
            .iter()
            .all(|url| state.authzs[url].status == AuthorizationStatus::Valid);
        let url = format!("{}/order/{}", BASE, state.next_id());
        let order = Order {
            finalize: format!("{}/finalize", url),
            url: url.clone(),
            status: if all_valid {
                OrderStatus::Ready
            } else {
                OrderStatus::Pending
            },
            expires: Some("2099-01-01T00:00:00Z".to_string()),
            domains,
            not_after: payload.not_after.clone(),
            authorizations,
            certificate: None,
            error: None,
        };
        state.orders.insert(
            url,
            OrderEntry {
                order: order.clone(),
                issuance_polls: 0,
            },
        );
        Ok(order)
    }

    fn fetch_order(&self, _account: &Account, url: &str) -> Result<Order, ApiError> {
        let mut state = self.lock();
        state.fail_point()?;
        state.stats.order_fetches += 1;
        let statuses: Vec<AuthorizationStatus> = state
            .orders
            .get(url)
            .ok_or_else(|| not_found(url))?
            .order
            .authorizations
            .iter()
            .filter_map(|a| state.authzs.get(a).map(|e| e.status))
            .collect();
        let delay = state.issuance_delay;
        let failure = state.issuance_failure.clone();
        let entry = state.orders.get_mut(url).ok_or_else(|| not_found(url))?;

        match entry.order.status {
            OrderStatus::Pending => {
                if statuses.iter().any(AuthorizationStatus::is_failed) {
                    entry.order.status = OrderStatus::Invalid;
                } else if statuses.iter().all(|s| *s == AuthorizationStatus::Valid) {
                    entry.order.status = OrderStatus::Ready;
                }
            }
            OrderStatus::Processing => {
                if let Some(reason) = failure {
                    entry.order.status = OrderStatus::Invalid;
                    entry.order.error =
                        Some(Problem::new("urn:ietf:params:acme:error:badCSR", reason));
                } else {
                    entry.issuance_polls = entry.issuance_polls.saturating_add(1);
                    if entry.issuance_polls >= delay {
                        entry.order.status = OrderStatus::Valid;
                        entry.order.certificate = Some(format!("{}/cert", url));
                    }
                }
            }
            _ => {}
        }
        Ok(entry.order.clone())
    }

    fn fetch_authorization(&self, account: &Account, url: &str) -> Result<Authorization, ApiError> {
        let thumbprint = account.key_pair.thumbprint()?;
        let mut state = self.lock();
        state.fail_point()?;
        state.stats.authorization_fetches += 1;
        let entry = state.authzs.get_mut(url).ok_or_else(|| not_found(url))?;

        if entry.challenge_status == ChallengeStatus::Processing {
            match entry.behavior.clone() {
                Behavior::ValidAfter(n) => {
                    entry.fetches_since_trigger += 1;
                    if entry.fetches_since_trigger >= n {
                        entry.status = AuthorizationStatus::Valid;
                        entry.challenge_status = ChallengeStatus::Valid;
                    }
                }
                Behavior::Invalid(reason) => {
                    entry.status = AuthorizationStatus::Invalid;
                    entry.challenge_status = ChallengeStatus::Invalid;
                    entry.error = Some(Problem::new(
                        "urn:ietf:params:acme:error:connection",
                        reason,
                    ));
                }
                _ => {}
            }
        }
        Ok(authz_view(url, entry, &thumbprint))
    }

    fn trigger_challenge(
        &self,
        account: &Account,
        challenge: &Challenge,
    ) -> Result<ChallengeStatus, ApiError> {
        let thumbprint = account.key_pair.thumbprint()?;
        let mut state = self.lock();
        state.fail_point()?;
        state.stats.triggers += 1;
        let watched = state.watched.clone();
        let authz_url = challenge
            .url
            .trim_end_matches(&format!("/{}", ChallengeType::Http01.as_str()))
            .to_string();
        let entry = state
            .authzs
            .get_mut(&authz_url)
            .ok_or_else(|| not_found(&challenge.url))?;

        let expected = format!("{}.{}", entry.token, thumbprint);
        if let Some(publisher) = watched {
            if publisher.get(&entry.token).as_deref() != Some(expected.as_str()) {
                entry.status = AuthorizationStatus::Invalid;
                entry.challenge_status = ChallengeStatus::Invalid;
                entry.error = Some(Problem::new(
                    "urn:ietf:params:acme:error:unauthorized",
                    "challenge content was not published",
                ));
                return Ok(entry.challenge_status);
            }
        }
        if entry.challenge_status == ChallengeStatus::Pending {
            entry.challenge_status = ChallengeStatus::Processing;
        }
        Ok(entry.challenge_status)
    }

    fn finalize_order(
        &self,
        _account: &Account,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<Order, ApiError> {
        let mut state = self.lock();
        state.fail_point()?;
        state.stats.finalizes += 1;
        let url = finalize_url.trim_end_matches("/finalize").to_string();
        let delay = state.issuance_delay;
        let failing = state.issuance_failure.is_some();
        let entry = state.orders.get_mut(&url).ok_or_else(|| not_found(finalize_url))?;
        if entry.order.status != OrderStatus::Ready {
            return Err(ApiError::Rejected {
                status: 403,
                problem: Problem::new(
                    "urn:ietf:params:acme:error:orderNotReady",
                    format!("order is {}", entry.order.status),
                ),
            });
        }

        let chain = Self::issue_certificate(&entry.order, csr_der)?;
        let cert_url = format!("{}/cert", url);
        entry.order.status = OrderStatus::Processing;
        if delay == 0 && !failing {
            entry.order.status = OrderStatus::Valid;
            entry.order.certificate = Some(cert_url.clone());
        }
        let order = entry.order.clone();
        state.certificates.insert(cert_url, chain.clone());
        state.last_chain = Some(chain);
        Ok(order)
    }

    fn download_certificate(&self, _account: &Account, url: &str) -> Result<Vec<u8>, ApiError> {
        let mut state = self.lock();
        state.fail_point()?;
        state.stats.downloads += 1;
        state
            .certificates
            .get(url)
            .cloned()
            .ok_or_else(|| not_found(url))
    }
}
