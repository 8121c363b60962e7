//! 控制平面工具函数
//!
//! 该模块封装了控制平面常用的工具函数：带抖动的指数退避重试、
//! 调用超时、按键串行化的互斥锁以及时长格式化。

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hdfs_guard_common::{Error, Result};

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 初始退避（毫秒）
    pub initial_backoff_ms: u64,
    /// 最大退避（毫秒）
    pub max_backoff_ms: u64,
    /// 退避倍数
    pub multiplier: f64,
    /// 抖动比例，0.2 表示 ±20%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的退避时长（attempt 从 1 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);
        apply_jitter(Duration::from_millis(capped as u64), self.jitter)
    }
}

/// 在 ±jitter 范围内随机调整时长
pub fn apply_jitter(duration: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || duration.is_zero() {
        return duration;
    }
    let jitter = jitter.min(1.0);
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    Duration::from_secs_f64(duration.as_secs_f64() * factor)
}

/// 为外部调用加上超时，超时映射为可重试的 [`Error::Timeout`]
pub async fn with_timeout<T, Fut>(timeout: Duration, operation: &str, future: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "{} 超过 {}",
            operation,
            format_duration(timeout)
        ))),
    }
}

/// 重试执行异步函数，只重试可重试的错误
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "尝试失败，准备重试: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 可取消的重试，取消时立即返回 [`Error::Cancelled`]
pub async fn with_retry_cancellable<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            result = f() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(operation, attempt, "尝试失败，准备重试: {}", e);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// 按键串行化的互斥锁
///
/// 同一个键同一时刻最多只有一个持有者，不同键之间互不影响。
/// 锁守卫被丢弃（包括所在 future 被取消）时自动释放。
#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyedLocks {
    /// 创建新的锁表
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取指定键的锁
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        debug!(key, "等待键锁");
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// 当前登记的键数量
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 锁表是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`KeyedLocks`] 的锁守卫
pub struct KeyedGuard {
    key: String,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // 没有其他等待者时清理条目
        if let Some(mutex) = locks.get(&self.key) {
            if Arc::strong_count(mutex) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

/// 以 0600 权限写入文件，已存在时覆盖
pub async fn write_private_file(path: &Path, bytes: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

/// 先写临时文件再重命名，读取方不会看到写了一半的内容
pub async fn replace_private_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".staging");
    let staging = std::path::PathBuf::from(staging);

    write_private_file(&staging, bytes).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

/// 格式化持续时间为人类可读的字符串
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();

    if seconds == 0 {
        return format!("{} 毫秒", duration.as_millis());
    }

    if seconds < 60 {
        return format!("{} 秒", seconds);
    }

    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{} 分钟 {} 秒", minutes, seconds % 60);
    }

    let hours = minutes / 60;
    if hours < 24 {
        return format!("{} 小时 {} 分钟", hours, minutes % 60);
    }

    let days = hours / 24;
    format!("{} 天 {} 小时", days, hours % 24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30 秒");
        assert_eq!(format_duration(Duration::from_secs(90)), "1 分钟 30 秒");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1 小时 0 分钟");
        assert_eq!(format_duration(Duration::from_secs(86400)), "1 天 0 小时");
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(20), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        for _ in 0..100 {
            let d = apply_jitter(Duration::from_millis(1000), 0.2);
            assert!(d >= Duration::from_millis(799) && d <= Duration::from_millis(1201));
        }
    }

    #[tokio::test]
    async fn test_retry_transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(5), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::KdcUnreachable("kdc".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_policy(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::PrincipalConflict {
                principal: "p".into(),
                owner: "o".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(Error::PrincipalConflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_policy(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::CaUnreachable("ca".into()))
        })
        .await;
        tokio_test::assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_cancellable() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> =
            with_retry_cancellable(&fast_policy(3), &token, "test", || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_retryable() {
        let result: Result<()> = with_timeout(Duration::from_millis(5), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("hdfs@LOCAL").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.lock("hdfs@LOCAL").await;
        });

        // 不同的键不受影响
        let _alice = locks.lock("alice@LOCAL").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        replace_private_file(&path, b"key").await.unwrap();
        replace_private_file(&path, b"rotated").await.unwrap();

        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).unwrap(), b"rotated");
        assert!(!dir.path().join("node.key.staging").exists());
    }

    #[tokio::test]
    async fn test_keyed_locks_cleanup() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.lock("bob@LOCAL").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }
}
