//! 시계
//!
//! - `ClockSource`: 서버 기준 시각 (마이크로초, epoch 기준)
//! - `LogicalClock`: 클라이언트 논리 시계, 주기적 진행과 보정이 같은 락을 사용

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// 현재 시각 공급자
pub trait ClockSource: Send + Sync {
    /// epoch 이후 마이크로초
    fn now_micros(&self) -> i64;
}

/// 시스템 시계
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_micros(&self) -> i64 {
        wall_clock_micros()
    }
}

/// 직접 조작하는 시계
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now_us: i64) -> Self {
        Self(AtomicI64::new(now_us))
    }

    pub fn set(&self, now_us: i64) {
        self.0.store(now_us, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_micros() as i64, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_micros(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// 시스템 시각 (마이크로초)
pub fn wall_clock_micros() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_micros() as i64,
        Err(before) => -(before.duration().as_micros() as i64),
    }
}

/// 클라이언트 논리 시계
#[derive(Debug, Clone)]
pub struct LogicalClock {
    now_us: Arc<Mutex<i64>>,
}

impl LogicalClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now_us: Arc::new(Mutex::new(start_us)),
        }
    }

    /// 시스템 시각에서 시작
    pub fn from_wall_clock() -> Self {
        Self::new(wall_clock_micros())
    }

    pub fn now_us(&self) -> i64 {
        *self.now_us.lock()
    }

    pub fn advance(&self, by: Duration) {
        *self.now_us.lock() += by.as_micros() as i64;
    }

    /// 서버가 보낸 보정값 적용
    pub fn apply_adjustment(&self, adjustment_us: i64) -> i64 {
        let mut now = self.now_us.lock();
        *now += adjustment_us;
        *now
    }

    /// 서버 시각 대비 오프셋
    pub fn offset_from(&self, server_time_us: i64) -> i64 {
        self.now_us() - server_time_us
    }

    /// `period`마다 `period`만큼 진행
    pub fn spawn_ticker(&self, period: Duration) -> JoinHandle<()> {
        let clock = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // 첫 tick은 즉시 반환
            interval.tick().await;
            loop {
                interval.tick().await;
                clock.advance(period);
                debug!("논리 시계 진행: {}", clock.now_us());
            }
        })
    }
}

impl ClockSource for LogicalClock {
    fn now_micros(&self) -> i64 {
        self.now_us()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_and_adjustment() {
        let clock = LogicalClock::new(1_000_000);
        assert_eq!(clock.offset_from(400_000), 600_000);
        assert_eq!(clock.apply_adjustment(-250_000), 750_000);
        assert_eq!(clock.offset_from(750_000), 0);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        clock.advance(Duration::from_millis(1));
        assert_eq!(clock.now_micros(), 1_010);
        clock.set(-5);
        assert_eq!(clock.now_micros(), -5);
    }

    #[test]
    fn test_ticks_and_corrections_do_not_lose_updates() {
        let clock = LogicalClock::new(0);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let clock = clock.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            clock.advance(Duration::from_micros(3));
                        } else {
                            clock.apply_adjustment(-1);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(clock.now_us(), 2 * 1000 * 3 - 2 * 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_advances_by_period() {
        let clock = LogicalClock::new(0);
        let ticker = clock.spawn_ticker(Duration::from_secs(3));

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert_eq!(clock.now_us(), 9_000_000);

        ticker.abort();
    }
}
