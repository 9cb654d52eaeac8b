//! Fixed-window rate limiter
//!
//! Counts requests per key inside a window (one minute by default). Used by the
//! API to throttle authenticated users and the public webhook endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the window resets, set when the request was rejected
    pub retry_after_seconds: Option<u64>,
}

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    window: Duration,
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    /// Count one request against `key`
    pub async fn check(&self, key: &str, limit: u32) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now.duration_since(window.started_at) >= self.window {
            *window = Window {
                started_at: now,
                count: 0,
            };
        }

        if window.count >= limit {
            let elapsed = now.duration_since(window.started_at);
            let retry_after = self.window.saturating_sub(elapsed).as_secs().max(1);
            return RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                retry_after_seconds: Some(retry_after),
            };
        }

        window.count += 1;
        RateLimitResult {
            allowed: true,
            limit,
            remaining: limit - window.count,
            retry_after_seconds: None,
        }
    }

    pub async fn check_user(&self, user_id: Uuid, limit: u32) -> RateLimitResult {
        self.check(&format!("user:{}", user_id), limit).await
    }

    pub async fn check_ip(&self, ip: &str, limit: u32) -> RateLimitResult {
        self.check(&format!("ip:{}", ip), limit).await
    }

    /// Drop windows that have already ended
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let window = self.window;
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started_at) < window);
        let removed = before - windows.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Rate limiter windows cleaned up");
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_request_allowed() {
        let limiter = RateLimiter::new_in_memory();
        let result = limiter.check_user(Uuid::new_v4(), 60).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 59);
        assert!(result.retry_after_seconds.is_none());
    }

    #[tokio::test]
    async fn test_request_over_limit_rejected() {
        let limiter = RateLimiter::new_in_memory();
        let user = Uuid::new_v4();
        for i in 0..5 {
            assert!(limiter.check_user(user, 5).await.allowed, "request {i}");
        }
        let result = limiter.check_user(user, 5).await;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert!(result.retry_after_seconds.is_some());
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let limiter = RateLimiter::new_in_memory();
        for _ in 0..3 {
            limiter.check_ip("10.0.0.1", 3).await;
        }
        assert!(!limiter.check_ip("10.0.0.1", 3).await.allowed);
        assert!(limiter.check_ip("10.0.0.2", 3).await.allowed);
    }

    #[tokio::test]
    async fn test_window_resets() {
        let limiter = RateLimiter::with_window(Duration::from_millis(20));
        assert!(limiter.check("k", 1).await.allowed);
        assert!(!limiter.check("k", 1).await.allowed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.check("k", 1).await.allowed);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_live_windows() {
        let limiter = RateLimiter::new_in_memory();
        limiter.check("k", 10).await;
        limiter.cleanup().await;
        let result = limiter.check("k", 10).await;
        assert_eq!(result.remaining, 8, "count survives cleanup");
    }

    #[tokio::test]
    async fn test_concurrent_requests_respect_limit() {
        let limiter = Arc::new(RateLimiter::new_in_memory());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.check("shared", 10).await }));
        }
        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
