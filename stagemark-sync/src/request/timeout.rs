//! Adaptive request timeouts

use std::time::Duration;

use crate::config::RequestConfig;
use crate::network::NetworkSpeed;

/// Hard ceiling on any computed timeout
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);
/// Retries never shorten a timeout below this
pub const MIN_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

pub const LARGE_PAYLOAD_BYTES: usize = 1024 * 1024;
pub const SMALL_PAYLOAD_BYTES: usize = 10 * 1024;

const RETRY_FACTOR: f64 = 0.75;
const SLOW_FACTOR: f64 = 2.0;
const FAST_FACTOR: f64 = 0.7;
const LARGE_FACTOR: f64 = 1.5;
const SMALL_FACTOR: f64 = 0.8;

/// Operation class selecting the base timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Default,
    ReadHeavy,
    WriteHeavy,
    Upload,
    Retry,
    Background,
}

/// Inputs that scale a base timeout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutContext {
    pub retry_count: u32,
    pub speed: Option<NetworkSpeed>,
    pub payload_bytes: Option<usize>,
}

impl TimeoutContext {
    pub fn retry(retry_count: u32) -> Self {
        Self {
            retry_count,
            ..Self::default()
        }
    }
}

impl RequestConfig {
    pub fn base_timeout(&self, class: RequestClass) -> Duration {
        match class {
            RequestClass::Default => self.default_timeout,
            RequestClass::ReadHeavy => self.read_heavy_timeout,
            RequestClass::WriteHeavy => self.write_heavy_timeout,
            RequestClass::Upload => self.upload_timeout,
            RequestClass::Retry => self.retry_timeout,
            RequestClass::Background => self.background_timeout,
        }
    }
}

/// Scale `base` by retry attempt, link speed and payload size, then clamp
/// to [`MAX_TIMEOUT`].
pub fn calculate_dynamic_timeout(base: Duration, ctx: &TimeoutContext) -> Duration {
    calculate_dynamic_timeout_with(base, ctx, MIN_RETRY_TIMEOUT, MAX_TIMEOUT)
}

pub fn calculate_dynamic_timeout_with(
    base: Duration,
    ctx: &TimeoutContext,
    min_retry: Duration,
    ceiling: Duration,
) -> Duration {
    let mut ms = base.as_secs_f64() * 1000.0;

    if ctx.retry_count > 0 {
        let exponent = i32::try_from(ctx.retry_count).unwrap_or(i32::MAX);
        let shortened = ms * RETRY_FACTOR.powi(exponent);
        // Floor only applies to the shortening; it never raises the base
        let floor = ms.min(min_retry.as_secs_f64() * 1000.0);
        ms = shortened.max(floor);
    }

    match ctx.speed {
        Some(NetworkSpeed::Slow) => ms *= SLOW_FACTOR,
        Some(NetworkSpeed::Fast) => ms *= FAST_FACTOR,
        Some(NetworkSpeed::Normal) | None => {}
    }

    match ctx.payload_bytes {
        Some(bytes) if bytes > LARGE_PAYLOAD_BYTES => ms *= LARGE_FACTOR,
        Some(bytes) if bytes < SMALL_PAYLOAD_BYTES => ms *= SMALL_FACTOR,
        _ => {}
    }

    let ceiling_ms = ceiling.as_secs_f64() * 1000.0;
    Duration::from_secs_f64(ms.clamp(0.0, ceiling_ms) / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_retry_shortens_timeout() {
        let first = calculate_dynamic_timeout(ms(10_000), &TimeoutContext::retry(0));
        let second = calculate_dynamic_timeout(ms(10_000), &TimeoutContext::retry(1));

        assert_eq!(first, ms(10_000));
        assert!(second <= first);
        assert!(first <= MAX_TIMEOUT && second <= MAX_TIMEOUT);
    }

    #[test]
    fn test_retry_floor() {
        let timeout = calculate_dynamic_timeout(ms(10_000), &TimeoutContext::retry(10));
        assert_eq!(timeout, MIN_RETRY_TIMEOUT);

        // A base already below the floor is left alone
        let small = calculate_dynamic_timeout(ms(2_000), &TimeoutContext::retry(3));
        assert_eq!(small, ms(2_000));
    }

    #[test]
    fn test_speed_and_size_factors() {
        let slow = TimeoutContext {
            speed: Some(NetworkSpeed::Slow),
            ..Default::default()
        };
        assert_eq!(calculate_dynamic_timeout(ms(10_000), &slow), ms(20_000));

        let fast = TimeoutContext {
            speed: Some(NetworkSpeed::Fast),
            ..Default::default()
        };
        assert_eq!(calculate_dynamic_timeout(ms(10_000), &fast), ms(7_000));

        let large = TimeoutContext {
            payload_bytes: Some(2 * LARGE_PAYLOAD_BYTES),
            ..Default::default()
        };
        assert_eq!(calculate_dynamic_timeout(ms(10_000), &large), ms(15_000));

        let small = TimeoutContext {
            payload_bytes: Some(100),
            ..Default::default()
        };
        assert_eq!(calculate_dynamic_timeout(ms(10_000), &small), ms(8_000));
    }

    #[test]
    fn test_ceiling() {
        let ctx = TimeoutContext {
            speed: Some(NetworkSpeed::Slow),
            payload_bytes: Some(5 * LARGE_PAYLOAD_BYTES),
            ..Default::default()
        };
        assert_eq!(calculate_dynamic_timeout(ms(45_000), &ctx), MAX_TIMEOUT);
    }

    #[test]
    fn test_base_timeout_per_class() {
        let config = RequestConfig::default();
        assert!(config.base_timeout(RequestClass::Upload) > config.base_timeout(RequestClass::Default));
        assert_eq!(config.base_timeout(RequestClass::Retry), Duration::from_secs(10));
    }
}
