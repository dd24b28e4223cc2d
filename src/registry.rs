//! 세션 레지스트리 (서버측)
//!
//! - 닉네임 → 세션, 주소 → 닉네임 두 인덱스
//! - 서버 역할 태스크만 소유/수정 (단일 writer)
//! - 연결 해제 시 주소 인덱스만 제거, 세션과 대기 큐는 유지

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{Error, NodeId, Result};

/// 등록된 피어 세션
#[derive(Debug, Clone)]
pub struct Session {
    /// 닉네임 (온라인 피어 사이에서 유일)
    pub identity: String,

    /// 현재 주소 (재접속 시 바뀔 수 있음)
    pub address: SocketAddr,

    /// 피어가 보고한 노드 ID (주소 공지용)
    pub node_id: NodeId,

    /// 온라인 여부
    ///
    /// `false`인 세션은 주소 인덱스에 없으므로 주소로 조회되지 않음.
    /// `Delivery`가 직접 내린 경우 `SessionRegistry::disconnect`로 인덱스도 정리해야 함
    pub online: bool,

    /// 이 피어가 차단한 닉네임 (중복 허용)
    pub block_list: Vec<String>,

    /// 전달되지 못한 페이로드 (FIFO)
    pub pending: VecDeque<Bytes>,
}

impl Session {
    fn new(identity: &str, address: SocketAddr, node_id: NodeId) -> Self {
        Self {
            identity: identity.to_string(),
            address,
            node_id,
            online: true,
            block_list: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// `sender`의 메시지를 차단했는지
    pub fn has_blocked(&self, sender: &str) -> bool {
        self.block_list.iter().any(|b| b == sender)
    }
}

/// 등록 결과
#[derive(Debug, Default)]
pub struct Registration {
    /// 기존 세션 재접속 여부
    pub reconnected: bool,

    /// 재접속 시 꺼낸 대기 페이로드 (보낸 순서 그대로)
    pub pending: Vec<Bytes>,
}

/// 세션 레지스트리
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    by_address: HashMap<SocketAddr, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 신규 등록 또는 재접속
    ///
    /// 온라인 상태인 닉네임은 `IdentityInUse`로 거부 (상태 변경 없음)
    pub fn register_or_reconnect(
        &mut self,
        address: SocketAddr,
        identity: &str,
        node_id: NodeId,
    ) -> Result<Registration> {
        let registration = match self.sessions.get_mut(identity) {
            Some(session) if session.online => {
                return Err(Error::IdentityInUse(identity.to_string()));
            }
            Some(session) => {
                let old_address = session.address;
                session.address = address;
                session.node_id = node_id;
                session.online = true;
                let pending: Vec<Bytes> = session.pending.drain(..).collect();

                if old_address != address
                    && self.by_address.get(&old_address).map(String::as_str) == Some(identity)
                {
                    self.by_address.remove(&old_address);
                }

                info!(
                    "재접속: {} @ {} (대기 메시지 {}개)",
                    identity,
                    address,
                    pending.len()
                );
                Registration {
                    reconnected: true,
                    pending,
                }
            }
            None => {
                self.sessions
                    .insert(identity.to_string(), Session::new(identity, address, node_id));
                info!("신규 등록: {} @ {}", identity, address);
                Registration::default()
            }
        };

        // 같은 주소의 이전 세션은 밀려남
        if let Some(previous) = self.by_address.insert(address, identity.to_string()) {
            if previous != identity {
                if let Some(session) = self.sessions.get_mut(&previous) {
                    if session.address == address {
                        session.online = false;
                    }
                }
                debug!("{}의 주소 {}를 {}가 대체", previous, address, identity);
            }
        }

        Ok(registration)
    }

    /// 주소 연결 해제
    ///
    /// 이미 해제된 주소면 아무것도 하지 않음
    pub fn disconnect(&mut self, address: SocketAddr) -> Option<String> {
        let identity = self.by_address.remove(&address)?;
        if let Some(session) = self.sessions.get_mut(&identity) {
            session.online = false;
        }
        info!("연결 해제: {} @ {}", identity, address);
        Some(identity)
    }

    /// 주소 → 닉네임
    pub fn resolve_identity(&self, address: SocketAddr) -> Result<&str> {
        self.by_address
            .get(&address)
            .map(String::as_str)
            .ok_or(Error::NotRegistered(address))
    }

    /// 차단 목록에 추가 (중복 검사 없음)
    pub fn block(&mut self, blocker: &str, blocked: &str) -> Result<()> {
        if !self.sessions.contains_key(blocked) {
            warn!("등록되지 않은 사용자 차단 시도: {} → {}", blocker, blocked);
        }

        let session = self
            .sessions
            .get_mut(blocker)
            .ok_or_else(|| Error::UnknownUser(blocker.to_string()))?;
        session.block_list.push(blocked.to_string());
        debug!("{}가 {} 차단", blocker, blocked);
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<&Session> {
        self.sessions.get(identity)
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut Session> {
        self.sessions.get_mut(identity)
    }

    /// 등록된 모든 닉네임 (정렬)
    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.sessions.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// 온라인 닉네임 (정렬)
    pub fn online_identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.online)
            .map(|s| s.identity.clone())
            .collect();
        identities.sort();
        identities
    }

    /// 온라인 세션의 (주소, 노드 ID)
    pub fn online_peers(&self) -> Vec<(SocketAddr, NodeId)> {
        self.sessions
            .values()
            .filter(|s| s.online)
            .map(|s| (s.address, s.node_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
