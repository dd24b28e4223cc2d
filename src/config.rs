//! 프로토콜 설정

use std::net::SocketAddr;
use std::time::Duration;

use crate::{
    CONFIRMATION_FAILURE_THRESHOLD, CONFIRMATION_TIMEOUT, DEFAULT_MULTICAST_GROUP,
    DEFAULT_SERVER_ADDR, ELECTION_WINDOW, MAX_RETRY, RETRY_INTERVAL, SYNC_PERIOD,
};

/// GPC 노드 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 그룹이 공유하는 서버 주소
    /// 선출된 노드도 같은 주소에 서버 소켓을 바인딩함
    pub server_addr: SocketAddr,

    /// 선거용 멀티캐스트 그룹
    pub multicast_group: SocketAddr,

    /// 최대 전송 시도 횟수
    pub max_retry: u32,

    /// 재시도 간격
    pub retry_interval: Duration,

    /// 서버 확인 응답 대기 시간
    pub confirmation_timeout: Duration,

    /// 연속 타임아웃 허용 횟수 (도달 시 선거 시작)
    pub confirmation_failure_threshold: u32,

    /// 시계 동기화 주기 (수집 창은 절반)
    pub sync_period: Duration,

    /// 선거 투표 수집 시간
    pub election_window: Duration,

    /// 클라이언트 논리 시계 진행 주기
    pub clock_tick: Duration,

    /// 서버의 주소 공지 주기
    pub address_announce_period: Duration,

    /// 서버 소켓 종료 재시도 횟수
    pub shutdown_retries: u32,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,

    /// 내부 채널 용량
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            max_retry: MAX_RETRY,
            retry_interval: RETRY_INTERVAL,
            confirmation_timeout: CONFIRMATION_TIMEOUT,
            confirmation_failure_threshold: CONFIRMATION_FAILURE_THRESHOLD,
            sync_period: SYNC_PERIOD,
            election_window: ELECTION_WINDOW,
            clock_tick: Duration::from_secs(3),
            address_announce_period: Duration::from_secs(10),
            shutdown_retries: 3,
            recv_buffer_size: 64 * 1024, // 64KB
            channel_capacity: 1024,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 시계 샘플 수집 창 길이
    pub fn sync_window(&self) -> Duration {
        self.sync_period / 2
    }

    /// 로컬 데모/테스트용 설정
    ///
    /// 프로토콜은 같고 모든 주기만 짧음
    pub fn accelerated() -> Self {
        Self {
            retry_interval: Duration::from_millis(20),
            confirmation_timeout: Duration::from_millis(100),
            sync_period: Duration::from_secs(1),
            election_window: Duration::from_secs(1),
            clock_tick: Duration::from_millis(300),
            address_announce_period: Duration::from_secs(1),
            ..Self::default()
        }
    }
}
