//! # GPC (Group Peer Coordination)
//!
//! UDP 위에서 동작하는 피어 그룹 조정 라이브러리
//!
//! ## 핵심 특징
//! - **신뢰성 전달**: 재시도 + 확인 응답, 오프라인 피어는 대기 큐에 보관
//! - **세션 레지스트리**: 닉네임 ↔ 주소 매핑, 재접속 시 대기 메시지 일괄 전달
//! - **시계 동기화**: 서버가 오프셋을 모아 그룹 평균으로 보정값 배포
//! - **서버 선출**: 연속 타임아웃 감지 후 멀티캐스트 bully 선거
//! - **역할 제어**: 한 프로세스에서 서버 인스턴스는 최대 하나

pub mod client;
pub mod clock;
pub mod clock_sync;
pub mod config;
pub mod delivery;
pub mod election;
pub mod error;
pub mod message;
pub mod registry;
pub mod role;
pub mod server;
pub mod stats;
pub mod transport;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub use client::{connect, ClientEvent, ClientHandle, ClientRole, ClientSession};
pub use clock::{ClockSource, LogicalClock, ManualClock, SystemClock};
pub use clock_sync::{ClockSample, ClockSync, Correction};
pub use config::Config;
pub use delivery::{check_blocked, Delivery, DeliveryOutcome, ServerLink};
pub use election::{ElectionCoordinator, ElectionHandle, ElectionPhase};
pub use error::{Error, Result};
pub use message::{FileChunk, FileChunkKind, Message, MessageType};
pub use registry::{Registration, Session, SessionRegistry};
pub use role::{RoleController, RoleHandle, RoleState};
pub use server::ServerRole;
pub use stats::DeliveryStats;
pub use transport::{Datagram, DatagramSink, Transport};

/// 선거에서 비교되는 노드 식별자 (기본값: 프로세스 ID)
pub type NodeId = u64;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC_NUMBER: u32 = 0x47504331; // "GPC1"

/// 최대 전송 시도 횟수
pub const MAX_RETRY: u32 = 3;

/// 재시도 간격
pub const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// 서버 확인 응답 대기 시간
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(1);

/// 선거를 시작하는 연속 타임아웃 횟수
pub const CONFIRMATION_FAILURE_THRESHOLD: u32 = 3;

/// 시계 동기화 주기
pub const SYNC_PERIOD: Duration = Duration::from_secs(10);

/// 선거 투표 수집 시간
pub const ELECTION_WINDOW: Duration = Duration::from_secs(10);

/// 기본 서버 주소
pub const DEFAULT_SERVER_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1200);

/// 기본 선거용 멀티캐스트 그룹
pub const DEFAULT_MULTICAST_GROUP: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(224, 0, 1, 60)), 1888);
