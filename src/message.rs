//! 프로토콜 메시지 정의
//!
//! 모든 데이터그램 = 고정 크기 헤더 + bincode 페이로드
//! 서버 확인 응답만 예외로 `OK` 두 바이트 프레임을 사용

use serde::{Deserialize, Serialize};

use crate::{Error, NodeId, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 서버 확인 응답 프레임
///
/// 헤더보다 짧으므로 인코딩된 메시지와 혼동되지 않음
pub const CONFIRMATION_FRAME: &[u8] = b"OK";

/// 헤더 크기: magic(4) + version(1) + msg_type(1) + payload_len(4) + crc32(4)
pub const HEADER_SIZE: usize = 14;

/// 파일 전송 조각 크기
pub const FILE_CHUNK_SIZE: usize = 1024;

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// 닉네임 등록 (클라이언트 → 서버)
    Login = 1,

    /// 등록 결과 (서버 → 클라이언트)
    LoginResponse = 2,

    /// 전체 메시지
    Broadcast = 3,

    /// 1:1 메시지
    DirectMessage = 4,

    /// 접속자 목록 요청/응답
    GetConnected = 5,

    /// 사용자 차단
    Block = 6,

    /// 파일 전송 조각
    FileChunk = 7,

    /// 시계 동기화 요청 (서버 → 클라이언트)
    ClockSyncPetition = 8,

    /// 시계 오프셋 보고/보정
    ClockOffsetReport = 9,

    /// 접속 종료
    Exit = 10,

    /// 에러 보고 (서버 → 클라이언트)
    Error = 11,

    /// 다른 피어 주소 공지
    AddressAnnouncement = 12,

    /// 선거 투표 (멀티캐스트)
    VoteAnnouncement = 13,

    /// 새 서버 공지 (멀티캐스트)
    CoordinatorAnnouncement = 14,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageType::Login,
            2 => MessageType::LoginResponse,
            3 => MessageType::Broadcast,
            4 => MessageType::DirectMessage,
            5 => MessageType::GetConnected,
            6 => MessageType::Block,
            7 => MessageType::FileChunk,
            8 => MessageType::ClockSyncPetition,
            9 => MessageType::ClockOffsetReport,
            10 => MessageType::Exit,
            11 => MessageType::Error,
            12 => MessageType::AddressAnnouncement,
            13 => MessageType::VoteAnnouncement,
            14 => MessageType::CoordinatorAnnouncement,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// 메시지 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 메시지 타입
    pub msg_type: MessageType,

    /// 메시지 길이 (헤더 제외)
    pub payload_len: u32,

    /// 페이로드 CRC32
    pub crc32: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, payload: &[u8]) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            msg_type,
            payload_len: payload.len() as u32,
            crc32: crc32fast::hash(payload),
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.push(self.version);
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.payload_len.to_le_bytes());
        buf.extend_from_slice(&self.crc32.to_le_bytes());
    }

    /// 헤더 파싱 (매직/버전/타입 검증 포함)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Truncated {
                need: HEADER_SIZE,
                got: bytes.len(),
            });
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: magic,
            });
        }

        let version = bytes[4];
        if version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        Ok(Self {
            magic,
            version,
            msg_type: MessageType::try_from(bytes[5])?,
            payload_len: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            crc32: u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]),
        })
    }
}

/// 파일 조각 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileChunkKind {
    Start,
    Mid,
    End,
}

/// 파일 전송 조각
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// 보낸 사람 (서버가 채움)
    pub from: String,
    pub to: String,
    pub filename: String,
    pub kind: FileChunkKind,
    pub content: Vec<u8>,
}

impl FileChunk {
    /// 파일 내용을 Start, Mid..., End 조각으로 분할
    ///
    /// Start/End는 내용 없이 경계만 표시
    pub fn split(to: &str, filename: &str, content: &[u8]) -> Vec<FileChunk> {
        let chunk = |kind, content: &[u8]| FileChunk {
            from: String::new(),
            to: to.to_string(),
            filename: filename.to_string(),
            kind,
            content: content.to_vec(),
        };

        let mut chunks = Vec::with_capacity(content.len() / FILE_CHUNK_SIZE + 3);
        chunks.push(chunk(FileChunkKind::Start, &[]));
        chunks.extend(
            content
                .chunks(FILE_CHUNK_SIZE)
                .map(|part| chunk(FileChunkKind::Mid, part)),
        );
        chunks.push(chunk(FileChunkKind::End, &[]));
        chunks
    }
}

/// 통합 메시지 enum
///
/// 시계 관련 시간 값은 모두 UNIX epoch 기준 마이크로초
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Login { nickname: String, node_id: NodeId },
    LoginResponse { node_id: NodeId },
    /// 클라이언트가 보낼 때 `from`은 비워둠
    Broadcast { from: String, message: String },
    DirectMessage { from: String, to: String, message: String },
    /// 요청 시 `users`는 비어 있음
    GetConnected { users: Vec<String> },
    Block { blocker: String, blocked: String },
    FileChunk(FileChunk),
    ClockSyncPetition { server_time_us: i64 },
    /// 클라이언트 → 서버: 보고된 오프셋, 서버 → 클라이언트: 보정값
    ClockOffsetReport { offset_us: i64 },
    Exit,
    Error { message: String },
    AddressAnnouncement { node_id: NodeId },
    VoteAnnouncement { candidate: NodeId },
    CoordinatorAnnouncement { leader: NodeId },
}

impl Message {
    /// 메시지 타입 반환
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Login { .. } => MessageType::Login,
            Message::LoginResponse { .. } => MessageType::LoginResponse,
            Message::Broadcast { .. } => MessageType::Broadcast,
            Message::DirectMessage { .. } => MessageType::DirectMessage,
            Message::GetConnected { .. } => MessageType::GetConnected,
            Message::Block { .. } => MessageType::Block,
            Message::FileChunk(_) => MessageType::FileChunk,
            Message::ClockSyncPetition { .. } => MessageType::ClockSyncPetition,
            Message::ClockOffsetReport { .. } => MessageType::ClockOffsetReport,
            Message::Exit => MessageType::Exit,
            Message::Error { .. } => MessageType::Error,
            Message::AddressAnnouncement { .. } => MessageType::AddressAnnouncement,
            Message::VoteAnnouncement { .. } => MessageType::VoteAnnouncement,
            Message::CoordinatorAnnouncement { .. } => MessageType::CoordinatorAnnouncement,
        }
    }

    /// 에러 메시지 생성
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let header = MessageHeader::new(self.msg_type(), &payload);

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        header.write_to(&mut buf);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = MessageHeader::parse(bytes)?;

        let need = HEADER_SIZE + header.payload_len as usize;
        if bytes.len() < need {
            return Err(Error::Truncated {
                need,
                got: bytes.len(),
            });
        }

        let payload = &bytes[HEADER_SIZE..need];
        let crc = crc32fast::hash(payload);
        if crc != header.crc32 {
            return Err(Error::CrcMismatch {
                expected: header.crc32,
                got: crc,
            });
        }

        let message: Message = bincode::deserialize(payload)?;
        if message.msg_type() != header.msg_type {
            return Err(Error::MessageTypeMismatch {
                expected: format!("{:?}", header.msg_type),
                got: format!("{:?}", message.msg_type()),
            });
        }

        Ok(message)
    }
}

/// 서버 확인 응답 여부
pub fn is_confirmation(bytes: &[u8]) -> bool {
    bytes == CONFIRMATION_FRAME
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> Vec<Message> {
        vec![
            Message::Login {
                nickname: "alice".into(),
                node_id: 4211,
            },
            Message::LoginResponse { node_id: 4211 },
            Message::Broadcast {
                from: String::new(),
                message: "hola a todos".into(),
            },
            Message::DirectMessage {
                from: "alice".into(),
                to: "bob".into(),
                message: "안녕".into(),
            },
            Message::GetConnected {
                users: vec!["alice".into(), "bob".into()],
            },
            Message::Block {
                blocker: "alice".into(),
                blocked: "mallory".into(),
            },
            Message::FileChunk(FileChunk {
                from: "alice".into(),
                to: "bob".into(),
                filename: "notes.txt".into(),
                kind: FileChunkKind::Start,
                content: Vec::new(),
            }),
            Message::FileChunk(FileChunk {
                from: "alice".into(),
                to: "bob".into(),
                filename: "notes.txt".into(),
                kind: FileChunkKind::Mid,
                content: vec![0xde, 0xad, 0xbe, 0xef],
            }),
            Message::FileChunk(FileChunk {
                from: "alice".into(),
                to: "bob".into(),
                filename: "notes.txt".into(),
                kind: FileChunkKind::End,
                content: Vec::new(),
            }),
            Message::ClockSyncPetition {
                server_time_us: 1_700_000_000_123_456,
            },
            Message::ClockOffsetReport {
                offset_us: -2_500_000,
            },
            Message::Exit,
            Message::error("Login already taken"),
            Message::AddressAnnouncement { node_id: 52000 },
            Message::VoteAnnouncement { candidate: 7 },
            Message::CoordinatorAnnouncement { leader: 9 },
        ]
    }

    #[test]
    fn test_every_kind_survives_codec() {
        for message in fixtures() {
            let bytes = message.to_bytes().unwrap();
            let restored = Message::from_bytes(&bytes).unwrap();
            assert_eq!(message, restored);
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = Message::Exit.to_bytes().unwrap();
        let header = MessageHeader::parse(&bytes).unwrap();

        assert_eq!(header.magic, MAGIC_NUMBER);
        assert_eq!(header.msg_type, MessageType::Exit);
        assert_eq!(bytes.len(), HEADER_SIZE + header.payload_len as usize);
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let mut bytes = Message::Broadcast {
            from: String::new(),
            message: "hello".into(),
        }
        .to_bytes()
        .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let err = Message::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::CrcMismatch { .. }));
        assert!(err.is_decode());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            Message::from_bytes(b"<Root><Type>Login</Type></Root>"),
            Err(Error::InvalidMagicNumber { .. })
        ));
        assert!(matches!(
            Message::from_bytes(CONFIRMATION_FRAME),
            Err(Error::Truncated { .. })
        ));

        let mut bytes = Message::Exit.to_bytes().unwrap();
        bytes[5] = 0xEE;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(Error::UnknownMessageType(0xEE))
        ));
    }

    #[test]
    fn test_file_split_boundaries() {
        let content: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let chunks = FileChunk::split("bob", "data.bin", &content);

        let kinds: Vec<FileChunkKind> = chunks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FileChunkKind::Start,
                FileChunkKind::Mid,
                FileChunkKind::Mid,
                FileChunkKind::Mid,
                FileChunkKind::End
            ]
        );
        assert_eq!(chunks[3].content.len(), 2500 - 2 * FILE_CHUNK_SIZE);

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.content.clone()).collect();
        assert_eq!(joined, content);
        assert!(chunks.iter().all(|c| c.to == "bob" && c.filename == "data.bin"));
    }

    #[test]
    fn test_confirmation_frame() {
        assert!(is_confirmation(b"OK"));
        assert!(!is_confirmation(&Message::Exit.to_bytes().unwrap()));
    }
}
