//! 전달 통계

use std::sync::atomic::{AtomicU64, Ordering};

/// 신뢰성 전달 계층 카운터
///
/// 여러 태스크가 공유하므로 원자 변수로 관리
#[derive(Debug, Default)]
pub struct DeliveryStats {
    /// 전송 성공한 데이터그램 수
    sent: AtomicU64,

    /// 실패 후 재시도한 횟수
    retries: AtomicU64,

    /// 재시도 소진으로 실패한 전송 수
    failed: AtomicU64,

    /// 대기 큐에 보관된 페이로드 수
    queued: AtomicU64,

    /// 재접속 시 비워진 대기 페이로드 수
    flushed: AtomicU64,

    /// 받은 서버 확인 응답 수
    confirmations: AtomicU64,

    /// 확인 응답 타임아웃 수
    confirmation_timeouts: AtomicU64,
}

/// 특정 시점의 통계 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub retries: u64,
    pub failed: u64,
    pub queued: u64,
    pub flushed: u64,
    pub confirmations: u64,
    pub confirmation_timeouts: u64,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flushed(&self, count: usize) {
        self.flushed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_confirmation(&self) {
        self.confirmations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_confirmation_timeout(&self) {
        self.confirmation_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            confirmations: self.confirmations.load(Ordering::Relaxed),
            confirmation_timeouts: self.confirmation_timeouts.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// 전송 시도 대비 실패 비율
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.sent + self.failed;
        if attempts == 0 {
            0.0
        } else {
            self.failed as f64 / attempts as f64
        }
    }

    /// 한 줄 요약
    pub fn summary(&self) -> String {
        format!(
            "sent={} retries={} failed={} ({:.1}%) queued={} flushed={} confirmed={} timeouts={}",
            self.sent,
            self.retries,
            self.failed,
            self.failure_rate() * 100.0,
            self.queued,
            self.flushed,
            self.confirmations,
            self.confirmation_timeouts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_failure_rate() {
        let stats = DeliveryStats::new();
        for _ in 0..3 {
            stats.record_sent();
        }
        stats.record_failed();
        stats.record_flushed(4);

        let snap = stats.snapshot();
        assert_eq!(snap.sent, 3);
        assert_eq!(snap.flushed, 4);
        assert!((snap.failure_rate() - 0.25).abs() < f64::EPSILON);
        assert!(snap.summary().contains("failed=1"));
    }
}
