//! 停滞检测器
//!
//! 检测拉取流长时间没有任何输出
//!
//! 核心机制：
//! 1. 每收到一行非空输出（无论能否解析）就刷新最后活动时间
//! 2. 距最后活动超过阈值即视为停滞
//! 3. 提供截止时间，供读取循环与下一行竞争

use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// 默认停滞阈值：60 秒
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// 计时器精度
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// 停滞检测器
#[derive(Debug, Clone)]
pub struct StallDetector {
    /// 最后一次收到输出的时间
    last_event_at: Instant,
    /// 停滞阈值
    timeout: Duration,
}

impl StallDetector {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            last_event_at: now,
            timeout,
        }
    }

    /// 记录一次活动
    pub fn touch(&mut self, now: Instant) {
        self.last_event_at = now;
    }

    /// 停滞截止时间：空闲时长超过阈值的第一个计时器刻度
    pub fn deadline(&self) -> Instant {
        self.last_event_at + self.timeout + TIMER_RESOLUTION
    }

    /// 检查是否停滞
    pub fn is_stalled(&self, now: Instant) -> bool {
        let idle = self.idle(now);
        if idle > self.timeout {
            info!(
                "⚠️ 拉取流停滞: {} 秒无输出 (阈值 {} 秒)",
                idle.as_secs(),
                self.timeout.as_secs()
            );
            return true;
        }
        false
    }

    /// 距最后一次活动的时长
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_event_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_stalled_within_timeout() {
        let t0 = Instant::now();
        let detector = StallDetector::new(Duration::from_secs(60), t0);
        assert!(!detector.is_stalled(t0 + Duration::from_secs(59)));
    }

    #[test]
    fn test_stalled_after_timeout() {
        let t0 = Instant::now();
        let detector = StallDetector::new(Duration::from_secs(60), t0);
        assert!(detector.is_stalled(t0 + Duration::from_secs(61)));
        assert_eq!(detector.idle(t0 + Duration::from_secs(61)).as_secs(), 61);
    }

    #[test]
    fn test_touch_pushes_deadline() {
        let t0 = Instant::now();
        let mut detector = StallDetector::new(Duration::from_secs(60), t0);

        detector.touch(t0 + Duration::from_secs(50));
        assert!(!detector.is_stalled(t0 + Duration::from_secs(100)));
        assert!(detector.is_stalled(t0 + Duration::from_secs(111)));
        assert!(detector.is_stalled(detector.deadline()));
    }

    #[test]
    fn test_exact_timeout_is_not_a_stall() {
        let t0 = Instant::now();
        let detector = StallDetector::new(Duration::from_secs(60), t0);
        assert!(!detector.is_stalled(t0 + Duration::from_secs(60)));
        assert!(detector.deadline() > t0 + Duration::from_secs(60));
        assert!(detector.is_stalled(t0 + Duration::from_millis(60_001)));
    }
}
