//! 시계 동기화 (서버측)
//!
//! Idle → Collecting → Idle, 주기 `sync_period`, 수집 창은 절반.
//! 보정 기준은 서버 시각이 아니라 그룹 평균 (초 단위 정수 평균)

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::ClockSource;
use crate::message::Message;

const MICROS_PER_SEC: i64 = 1_000_000;

/// 수집된 표본
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub peer: SocketAddr,
    pub reported_offset_us: i64,
    /// 수신 시각 + 보고된 오프셋
    pub derived_us: i64,
}

/// 피어별 보정값
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correction {
    pub peer: SocketAddr,
    pub adjustment_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Collecting,
}

pub struct ClockSync {
    clock: Arc<dyn ClockSource>,
    phase: SyncPhase,
    samples: Vec<ClockSample>,
    rounds: u64,
}

impl ClockSync {
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            clock,
            phase: SyncPhase::Idle,
            samples: Vec::new(),
            rounds: 0,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn samples(&self) -> &[ClockSample] {
        &self.samples
    }

    /// 서버 시각
    pub fn now_us(&self) -> i64 {
        self.clock.now_micros()
    }

    /// 수집 창 열기, 피어들에게 보낼 요청 반환
    pub fn open_window(&mut self) -> Message {
        self.phase = SyncPhase::Collecting;
        self.rounds += 1;
        let server_time_us = self.clock.now_micros();
        debug!("시계 동기화 라운드 {} 시작: {}", self.rounds, server_time_us);
        Message::ClockSyncPetition { server_time_us }
    }

    /// 오프셋 보고 기록 (수집 중일 때만)
    pub fn record(&mut self, peer: SocketAddr, reported_offset_us: i64) -> bool {
        if self.phase != SyncPhase::Collecting {
            return false;
        }

        let derived_us = self.clock.now_micros() + reported_offset_us;
        self.samples.push(ClockSample {
            peer,
            reported_offset_us,
            derived_us,
        });
        true
    }

    /// 수집 창 닫기, 보정값 계산
    ///
    /// 표본은 항상 비움
    pub fn close_window(&mut self) -> Vec<Correction> {
        self.phase = SyncPhase::Idle;
        let samples = std::mem::take(&mut self.samples);

        if samples.is_empty() {
            debug!("시계 동기화 라운드 {}: 표본 없음", self.rounds);
            return Vec::new();
        }

        let average_us = average_epoch_secs(&samples) * MICROS_PER_SEC;
        info!(
            "시계 동기화 라운드 {}: 표본 {}개, 평균 {}",
            self.rounds,
            samples.len(),
            average_us
        );

        samples
            .iter()
            .map(|s| Correction {
                peer: s.peer,
                adjustment_us: average_us - s.derived_us,
            })
            .collect()
    }
}

/// 초 단위로 내린 뒤 정수 평균
fn average_epoch_secs(samples: &[ClockSample]) -> i64 {
    let sum: i64 = samples
        .iter()
        .map(|s| s.derived_us.div_euclid(MICROS_PER_SEC))
        .sum();
    sum / samples.len() as i64
}
