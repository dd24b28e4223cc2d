//! 서버 선출 (bully 방식)
//!
//! - 연속 확인 응답 타임아웃 또는 다른 피어의 투표 수신 시 라운드 시작
//! - 자신의 ID를 멀티캐스트로 투표, `election_window` 동안 다른 투표 수집
//! - 더 큰 ID가 없으면 새 서버 공지 후 서버 역할 시작
//! - 새 서버 공지는 검증 없이 먼저 온 것을 채택

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::Message;
use crate::role::RoleHandle;
use crate::transport::{DatagramSink, DatagramStream};
use crate::{Config, NodeId};

/// 선거 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    Idle,
    Voting,
}

/// 코디네이터 입력 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    /// 서버 확인 응답 타임아웃 한도 도달
    ServerSuspected,
    /// 다른 피어의 투표
    Vote(NodeId),
    /// 새 서버 공지
    Coordinator(NodeId),
    /// 서버가 알려준 다른 피어
    PeerAnnounced(NodeId),
    /// 라운드 타이머 만료
    WindowClosed(u64),
}

/// 라운드 종료 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// 더 큰 ID가 있어 물러남
    Abstained { higher: NodeId },
    /// 자신이 새 서버
    Elected,
}

/// 외부에 공개되는 선거 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionStatus {
    pub phase: ElectionPhase,
    pub leader: Option<NodeId>,
    pub rounds_started: u64,
    pub known_peers: usize,
}

impl ElectionStatus {
    fn idle() -> Self {
        Self {
            phase: ElectionPhase::Idle,
            leader: None,
            rounds_started: 0,
            known_peers: 0,
        }
    }
}

/// 선거 상태 머신 (시간/네트워크 없음)
#[derive(Debug)]
pub struct Election {
    self_id: NodeId,
    phase: ElectionPhase,
    candidates: BTreeSet<NodeId>,
    round: u64,
    leader: Option<NodeId>,
}

impl Election {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            phase: ElectionPhase::Idle,
            candidates: BTreeSet::new(),
            round: 0,
            leader: None,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn phase(&self) -> ElectionPhase {
        self.phase
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// 이번 라운드에서 관측한 후보
    pub fn candidates(&self) -> &BTreeSet<NodeId> {
        &self.candidates
    }

    /// 라운드 시작, 이미 투표 중이면 `None`
    pub fn begin_round(&mut self) -> Option<u64> {
        if self.phase == ElectionPhase::Voting {
            return None;
        }
        self.phase = ElectionPhase::Voting;
        self.round += 1;
        self.candidates.clear();
        Some(self.round)
    }

    /// 투표 기록 (자기 자신, 투표 중이 아닐 때는 무시)
    pub fn record_vote(&mut self, candidate: NodeId) -> bool {
        if self.phase != ElectionPhase::Voting || candidate == self.self_id {
            return false;
        }
        self.candidates.insert(candidate)
    }

    /// 라운드 타이머 만료 처리
    ///
    /// 이미 끝난 라운드의 타이머면 `None`
    pub fn close_round(&mut self, round: u64) -> Option<RoundOutcome> {
        if self.phase != ElectionPhase::Voting || round != self.round {
            return None;
        }

        let higher = self
            .candidates
            .iter()
            .next_back()
            .copied()
            .filter(|c| *c > self.self_id);

        self.phase = ElectionPhase::Idle;
        self.candidates.clear();

        match higher {
            Some(higher) => Some(RoundOutcome::Abstained { higher }),
            None => {
                self.leader = Some(self.self_id);
                Some(RoundOutcome::Elected)
            }
        }
    }

    /// 새 서버 공지 채택
    pub fn adopt_coordinator(&mut self, leader: NodeId) {
        self.phase = ElectionPhase::Idle;
        self.candidates.clear();
        self.leader = Some(leader);
    }
}

/// 코디네이터 제어 핸들
#[derive(Clone)]
pub struct ElectionHandle {
    events: mpsc::Sender<ElectionEvent>,
    status: watch::Receiver<ElectionStatus>,
}

impl ElectionHandle {
    /// 서버 장애 의심 (투표 중이면 코디네이터가 무시)
    pub fn suspect_server(&self) {
        if let Err(e) = self.events.try_send(ElectionEvent::ServerSuspected) {
            debug!("선거 트리거 전달 실패: {}", e);
        }
    }

    /// 멀티캐스트로 받은 메시지 전달
    pub async fn on_multicast(&self, message: Message) {
        let event = match message {
            Message::VoteAnnouncement { candidate } => ElectionEvent::Vote(candidate),
            Message::CoordinatorAnnouncement { leader } => ElectionEvent::Coordinator(leader),
            other => {
                debug!("선거와 무관한 멀티캐스트 무시: {:?}", other.msg_type());
                return;
            }
        };

        if self.events.send(event).await.is_err() {
            debug!("선거 코디네이터 종료됨");
        }
    }

    /// 서버가 공지한 피어 기록
    pub fn announce_peer(&self, node_id: NodeId) {
        let _ = self.events.try_send(ElectionEvent::PeerAnnounced(node_id));
    }

    pub fn status(&self) -> ElectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_voting(&self) -> bool {
        self.status.borrow().phase == ElectionPhase::Voting
    }

    /// 조건을 만족하는 상태가 될 때까지 대기
    pub async fn wait_until(&self, predicate: impl FnMut(&ElectionStatus) -> bool) -> ElectionStatus {
        let mut status = self.status.clone();
        let result = match status.wait_for(predicate).await {
            Ok(current) => (*current).clone(),
            Err(_) => self.status(),
        };
        result
    }
}

/// 선거 코디네이터
///
/// 단일 태스크가 상태를 소유, 라운드마다 타이머 태스크 하나
pub struct ElectionCoordinator<S> {
    state: Election,
    sink: S,
    group: SocketAddr,
    server_addr: SocketAddr,
    window: Duration,
    role: RoleHandle,
    events_tx: mpsc::Sender<ElectionEvent>,
    events_rx: mpsc::Receiver<ElectionEvent>,
    status_tx: watch::Sender<ElectionStatus>,
    rounds_started: u64,
    known_peers: BTreeSet<NodeId>,
}

impl<S: DatagramSink> ElectionCoordinator<S> {
    pub fn new(
        self_id: NodeId,
        sink: S,
        config: &Config,
        role: RoleHandle,
    ) -> (Self, ElectionHandle) {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let (status_tx, status_rx) = watch::channel(ElectionStatus::idle());

        let handle = ElectionHandle {
            events: events_tx.clone(),
            status: status_rx,
        };

        let coordinator = Self {
            state: Election::new(self_id),
            sink,
            group: config.multicast_group,
            server_addr: config.server_addr,
            window: config.election_window,
            role,
            events_tx,
            events_rx,
            status_tx,
            rounds_started: 0,
            known_peers: BTreeSet::new(),
        };

        (coordinator, handle)
    }

    /// 이벤트 루프
    pub async fn run(mut self) {
        info!("선거 코디네이터 시작: node_id={}", self.state.self_id());

        while let Some(event) = self.events_rx.recv().await {
            self.handle_event(event).await;
            self.publish();
        }
    }

    async fn handle_event(&mut self, event: ElectionEvent) {
        match event {
            ElectionEvent::ServerSuspected => {
                if self.state.phase() == ElectionPhase::Voting {
                    debug!("이미 투표 중, 트리거 무시");
                    return;
                }
                self.start_round("서버 응답 없음").await;
            }

            ElectionEvent::Vote(candidate) => {
                if candidate == self.state.self_id() {
                    return;
                }
                if self.state.phase() == ElectionPhase::Idle {
                    self.start_round("다른 피어의 투표 수신").await;
                }
                if self.state.record_vote(candidate) {
                    debug!("투표 수신: {} (후보 {:?})", candidate, self.state.candidates());
                }
            }

            ElectionEvent::Coordinator(leader) => {
                info!("새 서버 공지 채택: {}", leader);
                self.state.adopt_coordinator(leader);
            }

            ElectionEvent::PeerAnnounced(node_id) => {
                if node_id != self.state.self_id() && self.known_peers.insert(node_id) {
                    debug!("피어 기록: {}", node_id);
                }
            }

            ElectionEvent::WindowClosed(round) => match self.state.close_round(round) {
                Some(RoundOutcome::Abstained { higher }) => {
                    info!(
                        "라운드 {} 종료: 더 큰 ID {} 존재, 서버 되지 않음 (내 ID {})",
                        round,
                        higher,
                        self.state.self_id()
                    );
                }
                Some(RoundOutcome::Elected) => self.promote(round).await,
                None => debug!("지난 라운드 {} 타이머 무시", round),
            },
        }
    }

    async fn start_round(&mut self, reason: &str) {
        let Some(round) = self.state.begin_round() else {
            return;
        };
        self.rounds_started += 1;
        info!(
            "선거 라운드 {} 시작 ({}): node_id={}",
            round,
            reason,
            self.state.self_id()
        );

        self.broadcast(&Message::VoteAnnouncement {
            candidate: self.state.self_id(),
        })
        .await;

        let tx = self.events_tx.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(ElectionEvent::WindowClosed(round)).await;
        });
    }

    async fn promote(&mut self, round: u64) {
        let self_id = self.state.self_id();
        info!("라운드 {}: 더 큰 ID 없음, 새 서버로 승격 (node_id={})", round, self_id);

        self.broadcast(&Message::CoordinatorAnnouncement { leader: self_id })
            .await;

        match self.role.request_start(self.server_addr) {
            Ok(true) => {}
            Ok(false) => debug!("서버 시작 요청이 이미 대기 중"),
            Err(e) => warn!("서버 시작 요청 실패: {}", e),
        }
    }

    async fn broadcast(&self, message: &Message) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("선거 메시지 직렬화 실패: {}", e);
                return;
            }
        };

        if let Err(e) = self.sink.send_to(self.group, &bytes).await {
            warn!("멀티캐스트 전송 실패 ({}): {}", self.group, e);
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(ElectionStatus {
            phase: self.state.phase(),
            leader: self.state.leader(),
            rounds_started: self.rounds_started,
            known_peers: self.known_peers.len(),
        });
    }
}

/// 멀티캐스트 수신 스트림을 코디네이터로 연결
pub fn listen_multicast(mut stream: DatagramStream, handle: ElectionHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = stream.recv().await {
            match item {
                Ok(datagram) => match Message::from_bytes(&datagram.payload) {
                    Ok(message) => handle.on_multicast(message).await,
                    Err(e) => warn!("멀티캐스트 메시지 해석 실패 ({}): {}", datagram.source, e),
                },
                Err(e) => {
                    warn!("멀티캐스트 수신 종료: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::Result;

    /// 코디네이터 없이 핸들만 생성 (트리거 이벤트를 직접 관찰)
    pub fn detached_election() -> (ElectionHandle, mpsc::Receiver<ElectionEvent>) {
        let (events, rx) = mpsc::channel(16);
        let (_status_tx, status) = watch::channel(ElectionStatus::idle());
        (ElectionHandle { events, status }, rx)
    }

    /// 메모리 멀티캐스트 버스 (보낸 노드 포함 모든 멤버에게 전달)
    #[derive(Clone, Default)]
    pub struct VoteBus {
        members: Arc<Mutex<Vec<ElectionHandle>>>,
        pub log: Arc<Mutex<Vec<Message>>>,
    }

    impl VoteBus {
        pub fn join(&self, handle: ElectionHandle) {
            self.members.lock().push(handle);
        }

        pub fn votes(&self) -> Vec<NodeId> {
            self.log
                .lock()
                .iter()
                .filter_map(|m| match m {
                    Message::VoteAnnouncement { candidate } => Some(*candidate),
                    _ => None,
                })
                .collect()
        }

        pub fn coordinators(&self) -> Vec<NodeId> {
            self.log
                .lock()
                .iter()
                .filter_map(|m| match m {
                    Message::CoordinatorAnnouncement { leader } => Some(*leader),
                    _ => None,
                })
                .collect()
        }
    }

    impl DatagramSink for VoteBus {
        async fn send_to(&self, _target: SocketAddr, bytes: &[u8]) -> Result<()> {
            let message = Message::from_bytes(bytes)?;
            self.log.lock().push(message.clone());

            let members = self.members.lock().clone();
            for member in members {
                member.on_multicast(message.clone()).await;
            }
            Ok(())
        }
    }
}
