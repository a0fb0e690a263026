//! Rate limiting for discovery probes
//!
//! Probes go through a global token bucket and a per-host bucket. Hosts
//! that keep failing get an extra backoff delay before each probe, which
//! decays again as they answer.

use crate::config::RateLimitConfig;
use crate::error::{EngineError, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(60);
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const BACKOFF_GROWTH: f64 = 1.5;
const BACKOFF_DECAY: f64 = 0.8;
const SAMPLES_PER_HOST: usize = 100;
const MAX_WAIT_STEP: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// Classic token bucket: `rate` tokens per second, at most `capacity` stored
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(rate: f64, capacity: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_update = now;
    }

    /// Take `tokens` if they are available right now
    pub async fn try_consume(&self, tokens: u32) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        let wanted = f64::from(tokens);
        if state.tokens >= wanted {
            state.tokens -= wanted;
            true
        } else {
            false
        }
    }

    /// Wait until `tokens` can be taken; `false` if `timeout` runs out first
    pub async fn acquire(&self, tokens: u32, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                let wanted = f64::from(tokens);
                if state.tokens >= wanted {
                    state.tokens -= wanted;
                    return true;
                }
                Duration::from_secs_f64((wanted - state.tokens) / self.rate).min(MAX_WAIT_STEP)
            };

            if let Some(timeout) = timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return false;
                }
                tokio::time::sleep(wait.min(timeout - elapsed)).await;
            } else {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Tokens currently stored
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }
}

#[derive(Debug, Clone)]
struct Sample {
    success: bool,
    response_time: Option<Duration>,
}

#[derive(Debug)]
struct HostState {
    bucket: Arc<TokenBucket>,
    backoff: Duration,
    samples: VecDeque<Sample>,
}

impl HostState {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            bucket: Arc::new(TokenBucket::new(config.per_host_limit, config.burst_size.max(1))),
            backoff: Duration::ZERO,
            samples: VecDeque::with_capacity(SAMPLES_PER_HOST),
        }
    }

    fn record(&mut self, sample: Sample) {
        if self.samples.len() == SAMPLES_PER_HOST {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStats {
    pub total_requests: usize,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub current_backoff_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterStats {
    pub total_requests: usize,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub active_hosts: usize,
}

/// Global plus per-host limiter with failure backoff
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: RateLimitConfig,
    global: TokenBucket,
    hosts: RwLock<HashMap<String, HostState>>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let global = TokenBucket::new(config.global_limit, (config.global_limit * 2.0).ceil() as u32);
        Self {
            config,
            global,
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Default wait for a token, see [`RateLimitConfig::acquire_timeout`]
    pub fn acquire_timeout(&self) -> Duration {
        self.config.acquire_timeout
    }

    async fn host_bucket(&self, host: &str) -> (Arc<TokenBucket>, Duration) {
        if let Some(state) = self.hosts.read().await.get(host) {
            return (state.bucket.clone(), state.backoff);
        }
        let mut hosts = self.hosts.write().await;
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(&self.config));
        (state.bucket.clone(), state.backoff)
    }

    /// Wait for permission to probe `host`
    pub async fn acquire(&self, host: &str, timeout: Option<Duration>) -> Result<()> {
        if !self.global.acquire(1, timeout).await {
            return Err(EngineError::rate_limited("global rate limit exceeded"));
        }
        let (bucket, backoff) = self.host_bucket(host).await;
        if !bucket.acquire(1, timeout).await {
            return Err(EngineError::rate_limited(format!("rate limit exceeded for host {host}")));
        }
        if !backoff.is_zero() {
            debug!(host, backoff_ms = backoff.as_millis() as u64, "Backing off before probe");
            tokio::time::sleep(backoff).await;
        }
        Ok(())
    }

    pub async fn record_success(&self, host: &str, response_time: Duration) {
        let mut hosts = self.hosts.write().await;
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(&self.config));
        state.record(Sample {
            success: true,
            response_time: Some(response_time),
        });
        state.backoff = state.backoff.mul_f64(BACKOFF_DECAY);
        if state.backoff < Duration::from_millis(1) {
            state.backoff = Duration::ZERO;
        }
    }

    pub async fn record_failure(&self, host: &str, error_kind: &str) {
        let mut hosts = self.hosts.write().await;
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(&self.config));
        state.record(Sample {
            success: false,
            response_time: None,
        });
        let current = if state.backoff.is_zero() { INITIAL_BACKOFF } else { state.backoff };
        state.backoff = current.mul_f64(BACKOFF_GROWTH).min(MAX_BACKOFF);
        warn!(
            host,
            error_kind,
            backoff_ms = state.backoff.as_millis() as u64,
            "Probe failed, increasing backoff"
        );
    }

    pub async fn host_stats(&self, host: &str) -> HostStats {
        let hosts = self.hosts.read().await;
        match hosts.get(host) {
            Some(state) => {
                let (total_requests, success_rate, avg_response_ms) = summarize(state.samples.iter());
                HostStats {
                    total_requests,
                    success_rate,
                    avg_response_ms,
                    current_backoff_ms: state.backoff.as_millis() as u64,
                }
            }
            None => HostStats::default(),
        }
    }

    pub async fn get_statistics(&self) -> RateLimiterStats {
        let hosts = self.hosts.read().await;
        let (total_requests, success_rate, avg_response_ms) =
            summarize(hosts.values().flat_map(|h| h.samples.iter()));
        RateLimiterStats {
            total_requests,
            success_rate,
            avg_response_ms,
            active_hosts: hosts.len(),
        }
    }
}

fn summarize<'a>(samples: impl Iterator<Item = &'a Sample>) -> (usize, f64, f64) {
    let mut total = 0usize;
    let mut successes = 0usize;
    let mut timed = Vec::new();
    for sample in samples {
        total += 1;
        if sample.success {
            successes += 1;
            if let Some(rt) = sample.response_time {
                timed.push(rt.as_secs_f64() * 1000.0);
            }
        }
    }
    let success_rate = if total == 0 { 0.0 } else { successes as f64 / total as f64 };
    let avg = if timed.is_empty() { 0.0 } else { timed.iter().sum::<f64>() / timed.len() as f64 };
    (total, success_rate, avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_host: f64, global: f64) -> RateLimitConfig {
        RateLimitConfig {
            per_host_limit: per_host,
            global_limit: global,
            burst_size: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bucket_drains_and_refills() {
        let bucket = TokenBucket::new(50.0, 2);
        assert!(bucket.try_consume(1).await);
        assert!(bucket.try_consume(1).await);
        assert!(!bucket.try_consume(1).await);

        assert!(bucket.acquire(1, Some(Duration::from_millis(500))).await);
    }

    #[tokio::test]
    async fn test_bucket_acquire_times_out() {
        let bucket = TokenBucket::new(0.1, 1);
        assert!(bucket.try_consume(1).await);
        let started = std::time::Instant::now();
        assert!(!bucket.acquire(1, Some(Duration::from_millis(50))).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_backoff_grows_on_failure_and_decays_on_success() {
        let limiter = AdaptiveRateLimiter::new(config(100.0, 100.0));
        limiter.record_failure("10.0.0.1", "timeout").await;
        let close = |actual: u64, expected: u64| actual.abs_diff(expected) <= 1;
        assert!(close(limiter.host_stats("10.0.0.1").await.current_backoff_ms, 150));

        limiter.record_failure("10.0.0.1", "timeout").await;
        assert!(close(limiter.host_stats("10.0.0.1").await.current_backoff_ms, 225));

        limiter.record_success("10.0.0.1", Duration::from_millis(20)).await;
        let stats = limiter.host_stats("10.0.0.1").await;
        assert!(close(stats.current_backoff_ms, 180));
        assert_eq!(stats.total_requests, 3);
        assert!((stats.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((stats.avg_response_ms - 20.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_backoff_is_capped() {
        let limiter = AdaptiveRateLimiter::new(config(100.0, 100.0));
        for _ in 0..40 {
            limiter.record_failure("h", "refused").await;
        }
        assert_eq!(limiter.host_stats("h").await.current_backoff_ms, 60_000);
    }

    #[tokio::test]
    async fn test_per_host_limit_is_independent() {
        let limiter = AdaptiveRateLimiter::new(config(0.5, 100.0));
        let short = Some(Duration::from_millis(20));
        assert!(limiter.acquire("a", short).await.is_ok());
        let err = limiter.acquire("a", short).await.unwrap_err();
        assert!(matches!(err, EngineError::RateLimited(_)));
        assert!(limiter.acquire("b", short).await.is_ok());

        let stats = limiter.get_statistics().await;
        assert_eq!(stats.active_hosts, 2);
        assert_eq!(stats.total_requests, 0);
    }

    #[tokio::test]
    async fn test_host_burst_follows_burst_size() {
        let limiter = AdaptiveRateLimiter::new(RateLimitConfig::default());
        let short = Some(Duration::from_millis(20));
        for _ in 0..20 {
            assert!(limiter.acquire("10.0.0.9", short).await.is_ok());
        }
        assert!(limiter.acquire("10.0.0.9", short).await.is_err());
        assert_eq!(limiter.acquire_timeout(), Duration::from_secs(10));
    }
}
