//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

/// GPC 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("전송 에러 ({addr}): {source}")]
    Transport {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("알 수 없는 메시지 타입: {0}")]
    UnknownMessageType(u8),

    #[error("메시지 타입 불일치: expected {expected}, got {got}")]
    MessageTypeMismatch { expected: String, got: String },

    #[error("잘린 패킷: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("존재하지 않는 사용자: {0}")]
    UnknownUser(String),

    #[error("로그인하지 않은 주소: {0}")]
    NotRegistered(SocketAddr),

    #[error("이미 사용 중인 닉네임: {0}")]
    IdentityInUse(String),

    #[error("전달 실패: {addr} ({attempts}회 시도)")]
    DeliveryFailed { addr: SocketAddr, attempts: u32 },

    #[error("서버 확인 응답 타임아웃")]
    ConfirmationTimeout,

    #[error("서버 소켓 종료 실패 ({attempts}회 시도)")]
    ServerShutdownFault { attempts: u32 },

    #[error("서버가 이미 실행 중: {0}")]
    ServerAlreadyRunning(SocketAddr),

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 잘못된 페이로드로 인한 에러인지 (발신자에게 Error 메시지로 보고)
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Error::Serialization(_)
                | Error::InvalidMagicNumber { .. }
                | Error::InvalidVersion { .. }
                | Error::CrcMismatch { .. }
                | Error::UnknownMessageType(_)
                | Error::MessageTypeMismatch { .. }
                | Error::Truncated { .. }
        )
    }

    /// 프로세스를 종료시켜야 하는 에러인지
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ServerShutdownFault { .. })
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
