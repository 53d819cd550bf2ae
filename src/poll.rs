//! 有上限的輪詢與可中斷的等待。
//!
//! CA 端的狀態轉換（授權驗證、憑證簽發）都需要輪詢。這裡的輪詢一定有總時限，
//! 每次等待都可以被 [`CancellationToken`] 中斷，不會無限期阻塞。

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, Weak},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// 輪詢的間隔與總時限。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    #[serde(with = "duration_secs", rename = "interval_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs", rename = "timeout_secs")]
    pub timeout: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// 授權輪詢的預設值：每 3 秒一次，最多 90 秒。
    pub const fn challenge_default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(90))
    }

    /// 訂單輪詢的預設值：每 3 秒一次，最多 120 秒。
    pub const fn order_default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(120))
    }
}

/// 暫時性網路錯誤的立即重試次數。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_network_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_network_retries: 3,
        }
    }
}

/// 時間來源。正式環境使用 [`SystemClock`]，測試可以注入手動推進的時鐘。
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;

    /// 等待 `duration`，若期間被取消則提早返回 `false`。
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        !cancel.wait_timeout(duration)
    }
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: Mutex<bool>,
    cond: Condvar,
    children: Mutex<Vec<Weak<TokenInner>>>,
}

impl TokenInner {
    fn cancel(&self) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            *cancelled = true;
        }
        self.cond.notify_all();
        let children = self
            .children
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.lock().map(|c| *c).unwrap_or(true)
    }
}

/// 可複製、可分層的取消訊號。
///
/// 取消父節點會一併取消所有由 [`CancellationToken::child`] 建立的子節點，反之則不會。
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        let child = Self::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        if let Ok(mut children) = self.inner.children.lock() {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // 父節點可能在登記期間被取消
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// 最多等待 `timeout`；回傳 `true` 表示因取消而結束。
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut cancelled) = self.inner.cancelled.lock() else {
            return true;
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.inner.cond.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => cancelled = guard,
                Err(_) => return true,
            }
        }
        true
    }
}

#[cfg(unix)]
impl CancellationToken {
    /// 收到 `signals` 中任一訊號時取消此 token，讓進行中的輪詢停下來。
    /// 已取消後再收到訊號則直接結束行程。
    ///
    /// # 參數
    ///
    /// * `signals` - 要攔截的訊號，例如 `SIGINT`、`SIGTERM`
    ///
    /// # Errors
    ///
    /// 無法註冊訊號處理器或建立監聽執行緒時回傳 [`std::io::Error`]。
    pub fn cancel_on_signals(&self, signals: &[std::ffi::c_int]) -> std::io::Result<()> {
        let mut signals = signal_hook::iterator::Signals::new(signals)?;
        let token = self.clone();
        std::thread::Builder::new()
            .name("signal-listener".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    if token.is_cancelled() {
                        tracing::warn!(signal, "Received signal again, exiting");
                        std::process::exit(128 + signal);
                    }
                    tracing::warn!(signal, "Received signal, cancelling");
                    token.cancel();
                }
            })?;
        Ok(())
    }
}

/// 單次輪詢嘗試的結果。
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// 依 `policy` 反覆呼叫 `attempt`，直到它回傳 `Some`、發生錯誤、逾時或被取消。
///
/// 第一次嘗試立即執行；之後每次嘗試之間等待 `interval`，
/// 若下一次等待會超過總時限則直接回傳 [`PollOutcome::TimedOut`]。
pub fn poll_until<T, E>(
    policy: &PollPolicy,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    mut attempt: impl FnMut() -> Result<Option<T>, E>,
) -> Result<PollOutcome<T>, E> {
    let start = clock.now();
    loop {
        if cancel.is_cancelled() {
            return Ok(PollOutcome::Cancelled);
        }
        if let Some(value) = attempt()? {
            return Ok(PollOutcome::Ready(value));
        }
        let elapsed = clock.now().saturating_duration_since(start);
        if elapsed + policy.interval > policy.timeout {
            return Ok(PollOutcome::TimedOut);
        }
        tracing::trace!(?elapsed, interval = ?policy.interval, "Waiting before next poll");
        if !clock.sleep(policy.interval, cancel) {
            return Ok(PollOutcome::Cancelled);
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
