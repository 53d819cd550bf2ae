use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    account::Account,
    client::{with_retries, AcmeApi, ApiError, Problem},
    poll::{poll_until, CancellationToken, Clock, PollOutcome, PollPolicy, RetryPolicy},
    publisher::{ChallengePublisher, PublishError},
};

/// 定義與挑戰（Challenge）流程相關的錯誤類型。
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("No http-01 challenge offered for {domain} (offered: {offered:?})")]
    Unsupported { domain: String, offered: Vec<String> },
    #[error("Authorization for {domain} ended {state}{}", suffix(.reason))]
    AuthorizationFailed {
        domain: String,
        state: ChallengeState,
        reason: Option<String>,
    },
    #[error("Failed to publish challenge for {domain}: {source}")]
    Publish {
        domain: String,
        #[source]
        source: PublishError,
    },
    #[error("Network error while authorizing {domain}: {source}")]
    Network {
        domain: String,
        #[source]
        source: ApiError,
    },
    #[error("Unexpected CA response while authorizing {domain}: {source}")]
    Api {
        domain: String,
        #[source]
        source: ApiError,
    },
    #[error("Authorization for {domain} was cancelled")]
    Cancelled { domain: String },
}

impl ChallengeError {
    /// 此錯誤所屬的網域。
    pub fn domain(&self) -> &str {
        match self {
            ChallengeError::Unsupported { domain, .. }
            | ChallengeError::AuthorizationFailed { domain, .. }
            | ChallengeError::Publish { domain, .. }
            | ChallengeError::Network { domain, .. }
            | ChallengeError::Api { domain, .. }
            | ChallengeError::Cancelled { domain } => domain,
        }
    }

    fn from_api(domain: &str, error: ApiError) -> Self {
        let domain = domain.to_string();
        match error {
            ApiError::Rejected { problem, .. } => ChallengeError::AuthorizationFailed {
                domain,
                state: ChallengeState::Invalid,
                reason: Some(problem.to_string()),
            },
            e if e.is_retryable() => ChallengeError::Network { domain, source: e },
            e => ChallengeError::Api { domain, source: e },
        }
    }
}

type Result<T> = std::result::Result<T, ChallengeError>;

fn suffix(reason: &Option<String>) -> String {
    reason
        .as_ref()
        .map(|r| format!(": {}", r))
        .unwrap_or_default()
}

/// ACME 挑戰類型。只有 HTTP-01 會被處理，其餘類型僅用於辨識與回報。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    Http01,
    Dns01,
    TlsAlpn01,
    Other(String),
}

impl ChallengeType {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "http-01" => Self::Http01,
            "dns-01" => Self::Dns01,
            "tls-alpn-01" => Self::TlsAlpn01,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
            Self::Other(s) => s,
        }
    }
}

/// CA 端的挑戰狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// CA 端的授權狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    /// 不會再變成 valid 的狀態。
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::Invalid | Self::Deactivated | Self::Expired | Self::Revoked
        )
    }
}

/// 一個 ACME 驗證挑戰。
///
/// `token` 與 `key_authorization` 由傳輸層依 CA 回應填入，處理流程不會自行推導。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub challenge_type: ChallengeType,
    pub url: String,
    pub token: String,
    pub status: ChallengeStatus,
    /// HTTP-01 檔案必須原樣回傳的內容。
    pub key_authorization: String,
    pub validated: Option<String>,
    pub error: Option<Problem>,
}

/// 單一網域的授權紀錄。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub url: String,
    pub domain: String,
    pub status: AuthorizationStatus,
    pub expires: Option<String>,
    pub wildcard: bool,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    pub fn http01(&self) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|c| c.challenge_type == ChallengeType::Http01)
    }

    /// 從 CA 重新取得授權狀態。這是授權狀態唯一會改變的地方。
    pub fn refresh(
        &mut self,
        api: &dyn AcmeApi,
        account: &Account,
        retry: &RetryPolicy,
    ) -> std::result::Result<(), ApiError> {
        let fresh = with_retries(retry, "fetch authorization", || {
            api.fetch_authorization(account, &self.url)
        })?;
        self.status = fresh.status;
        self.expires = fresh.expires;
        self.challenges = fresh.challenges;
        Ok(())
    }

    /// CA 在挑戰上回報的失敗原因（若有）。
    pub fn failure_reason(&self) -> Option<String> {
        self.challenges
            .iter()
            .find_map(|c| c.error.as_ref())
            .map(ToString::to_string)
    }
}

/// 單一授權在本地處理流程中的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Pending,
    Publishing,
    Triggered,
    Polling,
    Valid,
    Invalid,
    TimedOut,
}

impl fmt::Display for ChallengeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Publishing => "PUBLISHING",
            Self::Triggered => "TRIGGERED",
            Self::Polling => "POLLING",
            Self::Valid => "VALID",
            Self::Invalid => "INVALID",
            Self::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// 把一筆授權推進到終結狀態：發佈 HTTP-01 內容、通知 CA、再有限次地輪詢結果。
pub struct ChallengeProcessor<'a> {
    api: &'a dyn AcmeApi,
    publisher: &'a dyn ChallengePublisher,
    clock: &'a dyn Clock,
    poll: PollPolicy,
    retry: RetryPolicy,
}

impl<'a> ChallengeProcessor<'a> {
    /// # 參數
    ///
    /// - `api`: 與 CA 溝通的傳輸層。
    /// - `publisher`: 放置 key authorization 的發佈端。
    /// - `clock`: 輪詢等待使用的時鐘。
    /// - `poll`: 授權輪詢的間隔與總時限。
    /// - `retry`: 暫時性網路錯誤的重試次數。
    pub fn new(
        api: &'a dyn AcmeApi,
        publisher: &'a dyn ChallengePublisher,
        clock: &'a dyn Clock,
        poll: PollPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api,
            publisher,
            clock,
            poll,
            retry,
        }
    }

    /// 處理一筆授權，成功時回傳 [`ChallengeState::Valid`]。
    ///
    /// 已經是 valid 的授權不做任何事；失敗（invalid 或逾時）回傳
    /// [`ChallengeError::AuthorizationFailed`]，並帶有網域與 CA 提供的原因。
    pub fn process(
        &self,
        account: &Account,
        authorization: &mut Authorization,
        cancel: &CancellationToken,
    ) -> Result<ChallengeState> {
        let domain = authorization.domain.clone();

        if authorization.status == AuthorizationStatus::Valid {
            tracing::debug!(%domain, "Authorization already valid, skipping");
            return Ok(ChallengeState::Valid);
        }
        if authorization.status.is_failed() {
            return Err(ChallengeError::AuthorizationFailed {
                reason: authorization
                    .failure_reason()
                    .or_else(|| Some(format!("authorization is {:?}", authorization.status))),
                domain,
                state: ChallengeState::Invalid,
            });
        }

        let challenge = authorization
            .http01()
            .cloned()
            .ok_or_else(|| ChallengeError::Unsupported {
                domain: domain.clone(),
                offered: authorization
                    .challenges
                    .iter()
                    .map(|c| c.challenge_type.as_str().to_string())
                    .collect(),
            })?;

        Self::enter(&domain, ChallengeState::Publishing);
        self.publisher
            .publish(&challenge.token, &challenge.key_authorization)
            .map_err(|source| ChallengeError::Publish {
                domain: domain.clone(),
                source,
            })?;

        let result = self.trigger_and_poll(account, authorization, &challenge, cancel);

        if let Err(e) = self.publisher.unpublish(&challenge.token) {
            tracing::warn!(%domain, token = %challenge.token, error = %e, "Failed to unpublish challenge");
        }
        result
    }

    fn trigger_and_poll(
        &self,
        account: &Account,
        authorization: &mut Authorization,
        challenge: &Challenge,
        cancel: &CancellationToken,
    ) -> Result<ChallengeState> {
        let domain = authorization.domain.clone();

        if challenge.status == ChallengeStatus::Pending {
            Self::enter(&domain, ChallengeState::Triggered);
            let status = with_retries(&self.retry, "trigger challenge", || {
                self.api.trigger_challenge(account, challenge)
            })
            .map_err(|e| ChallengeError::from_api(&domain, e))?;
            tracing::debug!(%domain, ?status, "Challenge triggered");
        }

        Self::enter(&domain, ChallengeState::Polling);
        let outcome = poll_until(&self.poll, self.clock, cancel, || {
            authorization.refresh(self.api, account, &self.retry)?;
            let challenge_failed = authorization
                .http01()
                .is_some_and(|c| c.status == ChallengeStatus::Invalid);
            Ok(match authorization.status {
                AuthorizationStatus::Valid => Some(ChallengeState::Valid),
                AuthorizationStatus::Pending if !challenge_failed => None,
                _ => Some(ChallengeState::Invalid),
            })
        })
        .map_err(|e| ChallengeError::from_api(&domain, e))?;

        match outcome {
            PollOutcome::Ready(ChallengeState::Valid) => {
                Self::enter(&domain, ChallengeState::Valid);
                Ok(ChallengeState::Valid)
            }
            PollOutcome::Ready(state) => {
                Self::enter(&domain, state);
                Err(ChallengeError::AuthorizationFailed {
                    reason: authorization.failure_reason(),
                    domain,
                    state,
                })
            }
            PollOutcome::TimedOut => {
                Self::enter(&domain, ChallengeState::TimedOut);
                Err(ChallengeError::AuthorizationFailed {
                    domain,
                    state: ChallengeState::TimedOut,
                    reason: Some(format!(
                        "no terminal status within {:?}",
                        self.poll.timeout
                    )),
                })
            }
            PollOutcome::Cancelled => Err(ChallengeError::Cancelled { domain }),
        }
    }

    fn enter(domain: &str, state: ChallengeState) {
        tracing::debug!(domain, %state, "Authorization state");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{test_account, Behavior, FakeCa, ManualClock, RecordingPublisher};

    fn processor<'a>(
        ca: &'a FakeCa,
        publisher: &'a RecordingPublisher,
        clock: &'a ManualClock,
    ) -> ChallengeProcessor<'a> {
        ChallengeProcessor::new(
            ca,
            publisher,
            clock,
            PollPolicy::new(Duration::from_secs(3), Duration::from_secs(60)),
            RetryPolicy::default(),
        )
    }

    #[test]
    fn test_already_valid_is_noop() {
        let ca = FakeCa::new();
        ca.set_behavior("a.example", Behavior::AlreadyValid);
        let account = test_account(&ca);
        let mut authz = ca.authorization_for(&account, "a.example");
        let publisher = RecordingPublisher::new();
        let clock = ManualClock::new();

        let state = processor(&ca, &publisher, &clock)
            .process(&account, &mut authz, &CancellationToken::new())
            .unwrap();

        assert_eq!(state, ChallengeState::Valid);
        assert_eq!(publisher.publish_count(), 0);
        assert_eq!(ca.stats().triggers, 0);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_valid_after_trigger() {
        let ca = FakeCa::new();
        ca.set_behavior("a.example", Behavior::ValidAfter(2));
        let account = test_account(&ca);
        let mut authz = ca.authorization_for(&account, "a.example");
        let publisher = RecordingPublisher::new();
        let clock = ManualClock::new();
        ca.watch_publisher(publisher.clone());

        let state = processor(&ca, &publisher, &clock)
            .process(&account, &mut authz, &CancellationToken::new())
            .unwrap();

        assert_eq!(state, ChallengeState::Valid);
        assert_eq!(authz.status, AuthorizationStatus::Valid);
        assert_eq!(ca.stats().triggers, 1);
        assert_eq!(publisher.publish_count(), 1);
        // 結束後撤下內容
        assert!(publisher.is_empty());
    }

    #[test]
    fn test_invalid_carries_reason() {
        let ca = FakeCa::new();
        ca.set_behavior("a.example", Behavior::Invalid("connection refused".into()));
        let account = test_account(&ca);
        let mut authz = ca.authorization_for(&account, "a.example");
        let publisher = RecordingPublisher::new();
        let clock = ManualClock::new();

        let err = processor(&ca, &publisher, &clock)
            .process(&account, &mut authz, &CancellationToken::new())
            .unwrap_err();

        match err {
            ChallengeError::AuthorizationFailed {
                domain,
                state,
                reason,
            } => {
                assert_eq!(domain, "a.example");
                assert_eq!(state, ChallengeState::Invalid);
                assert!(reason.unwrap().contains("connection refused"));
            }
            other => panic!("預期 AuthorizationFailed，實際為 {:?}", other),
        }
    }

    #[test]
    fn test_never_resolving_authorization_times_out() {
        let ca = FakeCa::new();
        ca.set_behavior("a.example", Behavior::NeverResolves);
        let account = test_account(&ca);
        let mut authz = ca.authorization_for(&account, "a.example");
        let publisher = RecordingPublisher::new();
        let clock = ManualClock::new();

        let err = processor(&ca, &publisher, &clock)
            .process(&account, &mut authz, &CancellationToken::new())
            .unwrap_err();

        assert!(matches!(
            err,
            ChallengeError::AuthorizationFailed {
                state: ChallengeState::TimedOut,
                ..
            }
        ));
        assert!(clock.elapsed() <= Duration::from_secs(60));
        assert_eq!(ca.stats().authorization_fetches, 21);
    }

    #[test]
    fn test_missing_http01_is_unsupported() {
        let ca = FakeCa::new();
        ca.set_behavior("a.example", Behavior::DnsOnly);
        let account = test_account(&ca);
        let mut authz = ca.authorization_for(&account, "a.example");
        let publisher = RecordingPublisher::new();
        let clock = ManualClock::new();

        let err = processor(&ca, &publisher, &clock)
            .process(&account, &mut authz, &CancellationToken::new())
            .unwrap_err();

        match err {
            ChallengeError::Unsupported { offered, .. } => assert_eq!(offered, vec!["dns-01"]),
            other => panic!("預期 Unsupported，實際為 {:?}", other),
        }
        assert_eq!(ca.stats().triggers, 0);
    }

    #[test]
    fn test_cancelled_before_polling() {
        let ca = FakeCa::new();
        ca.set_behavior("a.example", Behavior::NeverResolves);
        let account = test_account(&ca);
        let mut authz = ca.authorization_for(&account, "a.example");
        let publisher = RecordingPublisher::new();
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = processor(&ca, &publisher, &clock)
            .process(&account, &mut authz, &cancel)
            .unwrap_err();
        assert!(matches!(err, ChallengeError::Cancelled { .. }));
    }

    #[test]
    fn test_transient_network_errors_are_retried() {
        let ca = FakeCa::new();
        ca.set_behavior("a.example", Behavior::ValidAfter(1));
        ca.fail_next_requests(2);
        let account = test_account(&ca);
        let mut authz = ca.authorization_for(&account, "a.example");
        let publisher = RecordingPublisher::new();
        let clock = ManualClock::new();

        let state = processor(&ca, &publisher, &clock)
            .process(&account, &mut authz, &CancellationToken::new())
            .unwrap();
        assert_eq!(state, ChallengeState::Valid);
    }
}
