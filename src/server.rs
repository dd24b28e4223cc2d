//! 서버 역할
//!
//! 단일 태스크가 레지스트리와 시계 동기화 상태를 소유하고
//! 수신 데이터그램, 동기화 주기, 주소 공지 주기를 한 루프에서 처리

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::ClockSource;
use crate::clock_sync::ClockSync;
use crate::delivery::{check_blocked, Delivery, DeliveryOutcome};
use crate::message::{is_confirmation, FileChunk, Message, CONFIRMATION_FRAME};
use crate::registry::SessionRegistry;
use crate::transport::{Datagram, DatagramSink, DatagramStream};
use crate::{Config, Error, Result};

const LOGIN_REQUIRED: &str = "Your user wasn't found. Please login first";

/// 서버 역할 상태
pub struct ServerRole<S> {
    delivery: Delivery<S>,
    registry: SessionRegistry,
    clock_sync: ClockSync,
    sync_period: Duration,
    sync_window: Duration,
    announce_period: Duration,
}

impl<S: DatagramSink> ServerRole<S> {
    pub fn new(sink: S, config: &Config, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            delivery: Delivery::new(sink, config),
            registry: SessionRegistry::new(),
            clock_sync: ClockSync::new(clock),
            sync_period: config.sync_period,
            sync_window: config.sync_window(),
            announce_period: config.address_announce_period,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn clock_sync(&self) -> &ClockSync {
        &self.clock_sync
    }

    pub fn delivery(&self) -> &Delivery<S> {
        &self.delivery
    }

    /// 수신 데이터그램 하나 처리
    pub async fn handle_datagram(&mut self, datagram: Datagram) {
        let source = datagram.source;
        if is_confirmation(&datagram.payload) {
            debug!("서버로 온 확인 응답 무시: {}", source);
            return;
        }

        let decoded = Message::from_bytes(&datagram.payload);

        // 오프셋 보고는 `ServerLink`를 거치지 않으므로 확인 응답 대상 아님
        let confirm = !matches!(decoded, Ok(Message::ClockOffsetReport { .. }));
        if confirm {
            if let Err(e) = self.delivery.send_reliable(source, CONFIRMATION_FRAME).await {
                warn!("확인 응답 실패, 연결 해제 ({}): {}", source, e);
                self.registry.disconnect(source);
                return;
            }
        }

        let message = match decoded {
            Ok(message) => message,
            Err(e) if e.is_decode() => {
                warn!("메시지 해석 실패 ({}): {}", source, e);
                self.reply(source, Message::error(format!("Malformed message: {}", e)))
                    .await;
                return;
            }
            Err(e) => {
                warn!("데이터그램 처리 실패 ({}): {}", source, e);
                return;
            }
        };

        if let Message::Login { nickname, node_id } = message {
            self.handle_login(source, &nickname, node_id).await;
            return;
        }

        let identity = match self.registry.resolve_identity(source) {
            Ok(identity) => identity.to_string(),
            Err(_) => {
                debug!("미등록 주소의 메시지 거부: {} ({:?})", source, message.msg_type());
                self.reply(source, Message::error(LOGIN_REQUIRED)).await;
                return;
            }
        };

        self.dispatch(source, identity, message).await;
    }

    async fn handle_login(&mut self, source: SocketAddr, nickname: &str, node_id: crate::NodeId) {
        let registration = match self.registry.register_or_reconnect(source, nickname, node_id) {
            Ok(registration) => registration,
            Err(Error::IdentityInUse(identity)) => {
                self.reply(
                    source,
                    Message::error(format!("The nickname {} is already in use", identity)),
                )
                .await;
                return;
            }
            Err(e) => {
                self.reply(source, Message::error(e.to_string())).await;
                return;
            }
        };

        self.reply(source, Message::LoginResponse { node_id }).await;

        if registration.pending.is_empty() {
            return;
        }
        if let Some(session) = self.registry.get_mut(nickname) {
            let delivered = self
                .delivery
                .flush_pending(session, registration.pending)
                .await;
            let went_offline = !session.online;
            info!("{}에게 대기 메시지 {}개 전달", nickname, delivered);
            if went_offline {
                self.registry.disconnect(source);
            }
        }
    }

    async fn dispatch(&mut self, source: SocketAddr, identity: String, message: Message) {
        match message {
            Message::Broadcast { message, .. } => {
                let forwarded = Message::Broadcast {
                    from: identity.clone(),
                    message,
                };
                self.fan_out(&identity, &forwarded).await;
            }

            Message::DirectMessage { to, message, .. } => {
                let forwarded = Message::DirectMessage {
                    from: identity.clone(),
                    to: to.clone(),
                    message,
                };
                self.relay(source, &identity, &to, &forwarded).await;
            }

            Message::FileChunk(chunk) => {
                let to = chunk.to.clone();
                let forwarded = Message::FileChunk(FileChunk {
                    from: identity.clone(),
                    ..chunk
                });
                self.relay(source, &identity, &to, &forwarded).await;
            }

            Message::GetConnected { .. } => {
                let users = self.registry.online_identities();
                self.reply(source, Message::GetConnected { users }).await;
            }

            Message::Block { blocker, blocked } => {
                if blocker != identity {
                    warn!("차단 요청의 blocker 불일치: {} (실제 {})", blocker, identity);
                }
                if let Err(e) = self.registry.block(&identity, &blocked) {
                    self.reply(source, Message::error(e.to_string())).await;
                }
            }

            Message::ClockOffsetReport { offset_us } => {
                if !self.clock_sync.record(source, offset_us) {
                    debug!("수집 창 밖의 오프셋 보고 무시: {}", source);
                }
            }

            Message::Exit => {
                self.registry.disconnect(source);
            }

            Message::Login { nickname, node_id } => {
                self.handle_login(source, &nickname, node_id).await;
            }

            other @ (Message::LoginResponse { .. }
            | Message::Error { .. }
            | Message::ClockSyncPetition { .. }
            | Message::AddressAnnouncement { .. }
            | Message::VoteAnnouncement { .. }
            | Message::CoordinatorAnnouncement { .. }) => {
                warn!("서버가 처리하지 않는 메시지: {:?} ({})", other.msg_type(), identity);
                self.reply(
                    source,
                    Message::error(format!("Unexpected message type {:?}", other.msg_type())),
                )
                .await;
            }
        }
    }

    /// 보낸 사람을 제외한 모든 세션으로 전달
    async fn fan_out(&mut self, sender: &str, message: &Message) {
        let payload = match message.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!("브로드캐스트 직렬화 실패: {}", e);
                return;
            }
        };

        let mut delivered = 0;
        let mut queued = 0;
        for identity in self.registry.identities() {
            if identity == sender {
                continue;
            }
            match self.deliver(&identity, sender, payload.clone()).await {
                Some(DeliveryOutcome::Delivered) => delivered += 1,
                Some(DeliveryOutcome::Queued) => queued += 1,
                None => {}
            }
        }
        debug!("{} 브로드캐스트: 전달 {}, 대기 {}", sender, delivered, queued);
    }

    /// 특정 닉네임으로 전달
    async fn relay(&mut self, source: SocketAddr, sender: &str, to: &str, message: &Message) {
        let payload = match message.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!("메시지 직렬화 실패: {}", e);
                return;
            }
        };

        if self.registry.get(to).is_none() {
            self.reply(source, Message::error(format!("User {} not found", to)))
                .await;
            return;
        }

        self.deliver(to, sender, payload).await;
    }

    /// 차단 확인 후 전달 또는 대기
    ///
    /// 전송이 실패해 오프라인이 된 세션은 주소 인덱스에서도 제거
    /// (Exit와 같은 상태, 다시 로그인하면 대기 메시지 전달)
    async fn deliver(
        &mut self,
        identity: &str,
        sender: &str,
        payload: Bytes,
    ) -> Option<DeliveryOutcome> {
        let session = self.registry.get_mut(identity)?;
        if check_blocked(session, sender) {
            debug!("{}가 {}를 차단, 전달하지 않음", identity, sender);
            return None;
        }

        let address = session.address;
        let was_online = session.online;
        let outcome = self.delivery.deliver_or_queue(session, payload).await;
        if was_online && !session.online {
            self.registry.disconnect(address);
        }
        Some(outcome)
    }

    /// 요청자에게 직접 응답 (대기 큐 사용 안 함)
    async fn reply(&self, target: SocketAddr, message: Message) {
        if let Err(e) = self.send(target, &message).await {
            warn!("응답 전송 실패 ({}): {}", target, e);
        }
    }

    async fn send(&self, target: SocketAddr, message: &Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        self.delivery.send_reliable(target, &bytes).await
    }

    /// 동기화 요청 전송 후 수집 창 열기
    pub async fn open_sync_window(&mut self) {
        let petition = self.clock_sync.open_window();
        for (address, _) in self.registry.online_peers() {
            if let Err(e) = self.send(address, &petition).await {
                warn!("동기화 요청 실패, 연결 해제 ({}): {}", address, e);
                self.registry.disconnect(address);
            }
        }
    }

    /// 수집 창 닫고 보정값 전송
    pub async fn close_sync_window(&mut self) {
        for correction in self.clock_sync.close_window() {
            let message = Message::ClockOffsetReport {
                offset_us: correction.adjustment_us,
            };
            if let Err(e) = self.send(correction.peer, &message).await {
                warn!("보정값 전송 실패 ({}): {}", correction.peer, e);
            }
        }
    }

    /// 온라인 세션마다 다른 온라인 세션의 노드 ID 공지
    pub async fn announce_addresses(&mut self) {
        let peers = self.registry.online_peers();
        for (target, _) in &peers {
            for (other, node_id) in &peers {
                if other == target {
                    continue;
                }
                let message = Message::AddressAnnouncement { node_id: *node_id };
                if let Err(e) = self.send(*target, &message).await {
                    debug!("주소 공지 실패 ({}): {}", target, e);
                    break;
                }
            }
        }
    }

    /// 서버 루프
    ///
    /// 수신 스트림이 끝나면 종료
    pub async fn run(mut self, mut inbound: DatagramStream) {
        let mut sync = tokio::time::interval(self.sync_period);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut announce = tokio::time::interval(self.announce_period);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // 수집 창 마감 시각 (열려 있을 때만)
        let mut window_close: Option<Instant> = None;

        info!("서버 역할 시작");

        loop {
            tokio::select! {
                item = inbound.recv() => match item {
                    Some(Ok(datagram)) => self.handle_datagram(datagram).await,
                    Some(Err(e)) => {
                        warn!("서버 수신 종료: {}", e);
                        break;
                    }
                    None => break,
                },

                _ = sync.tick() => {
                    if window_close.is_none() {
                        self.open_sync_window().await;
                        window_close = Some(Instant::now() + self.sync_window);
                    }
                }

                _ = sleep_until(window_close) => {
                    window_close = None;
                    self.close_sync_window().await;
                }

                _ = announce.tick() => self.announce_addresses().await,
            }
        }

        info!(
            "서버 역할 종료: 세션 {}개, {}",
            self.registry.len(),
            self.delivery.stats().snapshot().summary()
        );
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::FileChunkKind;
    use crate::transport::testing::RecordingSink;

    const T: i64 = 1_700_000_000_500_000;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn server() -> (ServerRole<RecordingSink>, RecordingSink, Arc<ManualClock>) {
        let sink = RecordingSink::new();
        let clock = Arc::new(ManualClock::new(T));
        let role = ServerRole::new(sink.clone(), &Config::default(), clock.clone());
        (role, sink, clock)
    }

    async fn receive(role: &mut ServerRole<RecordingSink>, from: SocketAddr, message: Message) {
        let bytes = message.to_bytes().unwrap();
        role.handle_datagram(Datagram::new(bytes, from)).await;
    }

    async fn login(role: &mut ServerRole<RecordingSink>, port: u16, nickname: &str) {
        receive(
            role,
            addr(port),
            Message::Login {
                nickname: nickname.into(),
                node_id: port as u64,
            },
        )
        .await;
    }

    #[tokio::test]
    async fn test_login_confirms_and_responds() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;

        let raw = sink.raw_to(addr(5000));
        assert_eq!(raw[0], CONFIRMATION_FRAME);
        assert_eq!(
            sink.messages_to(addr(5000)),
            vec![Message::LoginResponse { node_id: 5000 }]
        );
        assert_eq!(role.registry().resolve_identity(addr(5000)).unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_duplicate_login_gets_error() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        login(&mut role, 6000, "alice").await;

        let replies = sink.messages_to(addr(6000));
        assert!(matches!(replies.as_slice(), [Message::Error { .. }]));
        assert!(role.registry().resolve_identity(addr(6000)).is_err());
    }

    #[tokio::test]
    async fn test_unregistered_sender_is_told_to_login() {
        let (mut role, sink, _) = server();
        receive(
            &mut role,
            addr(5000),
            Message::Broadcast {
                from: String::new(),
                message: "hi".into(),
            },
        )
        .await;

        assert_eq!(
            sink.messages_to(addr(5000)),
            vec![Message::error(LOGIN_REQUIRED)]
        );
    }

    #[tokio::test]
    async fn test_malformed_datagram_gets_error_reply() {
        let (mut role, sink, _) = server();
        role.handle_datagram(Datagram::new(vec![0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], addr(5000)))
            .await;

        let replies = sink.messages_to(addr(5000));
        assert!(matches!(replies.as_slice(), [Message::Error { .. }]));
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_blockers() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        login(&mut role, 5001, "bob").await;
        login(&mut role, 5002, "carol").await;
        receive(
            &mut role,
            addr(5002),
            Message::Block {
                blocker: "carol".into(),
                blocked: "alice".into(),
            },
        )
        .await;
        sink.clear();

        receive(
            &mut role,
            addr(5000),
            Message::Broadcast {
                from: String::new(),
                message: "hello".into(),
            },
        )
        .await;

        let expected = Message::Broadcast {
            from: "alice".into(),
            message: "hello".into(),
        };
        assert_eq!(sink.messages_to(addr(5001)), vec![expected]);
        assert!(sink.messages_to(addr(5002)).is_empty());
        assert!(sink.messages_to(addr(5000)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_recipient_gets_queue_flushed_on_reconnect() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        login(&mut role, 5001, "bob").await;
        receive(&mut role, addr(5001), Message::Exit).await;

        for text in ["one", "two", "three"] {
            receive(
                &mut role,
                addr(5000),
                Message::DirectMessage {
                    from: String::new(),
                    to: "bob".into(),
                    message: text.into(),
                },
            )
            .await;
        }
        assert_eq!(role.registry().get("bob").unwrap().pending.len(), 3);

        sink.clear();
        login(&mut role, 5009, "bob").await;

        let texts: Vec<String> = sink
            .messages_to(addr(5009))
            .into_iter()
            .filter_map(|m| match m {
                Message::DirectMessage { from, message, .. } => {
                    assert_eq!(from, "alice");
                    Some(message)
                }
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!(role.registry().get("bob").unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn test_direct_message_to_unknown_user() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        sink.clear();

        receive(
            &mut role,
            addr(5000),
            Message::DirectMessage {
                from: String::new(),
                to: "nobody".into(),
                message: "hi".into(),
            },
        )
        .await;

        assert_eq!(
            sink.messages_to(addr(5000)),
            vec![Message::error("User nobody not found")]
        );
    }

    #[tokio::test]
    async fn test_file_chunk_relayed_with_sender() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        login(&mut role, 5001, "bob").await;

        let chunk = FileChunk {
            from: String::new(),
            to: "bob".into(),
            filename: "notes.txt".into(),
            kind: FileChunkKind::Start,
            content: b"hello".to_vec(),
        };
        receive(&mut role, addr(5000), Message::FileChunk(chunk.clone())).await;

        let relayed = sink
            .messages_to(addr(5001))
            .into_iter()
            .find(|m| matches!(m, Message::FileChunk(_)));
        assert_eq!(
            relayed,
            Some(Message::FileChunk(FileChunk {
                from: "alice".into(),
                ..chunk
            }))
        );
    }

    #[tokio::test]
    async fn test_get_connected_lists_online_identities() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        login(&mut role, 5001, "bob").await;
        login(&mut role, 5002, "carol").await;
        receive(&mut role, addr(5002), Message::Exit).await;
        sink.clear();

        receive(&mut role, addr(5000), Message::GetConnected { users: vec![] }).await;
        assert_eq!(
            sink.messages_to(addr(5000)),
            vec![Message::GetConnected {
                users: vec!["alice".into(), "bob".into()]
            }]
        );
    }

    #[tokio::test]
    async fn test_sync_round_sends_corrections() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        login(&mut role, 5001, "bob").await;
        sink.clear();

        role.open_sync_window().await;
        assert_eq!(
            sink.messages_to(addr(5000)),
            vec![Message::ClockSyncPetition { server_time_us: T }]
        );

        receive(&mut role, addr(5000), Message::ClockOffsetReport { offset_us: 2_000_000 }).await;
        receive(&mut role, addr(5001), Message::ClockOffsetReport { offset_us: -1_000_000 }).await;
        sink.clear();

        role.close_sync_window().await;
        assert_eq!(
            sink.messages_to(addr(5000)),
            vec![Message::ClockOffsetReport { offset_us: -2_500_000 }]
        );
        assert_eq!(
            sink.messages_to(addr(5001)),
            vec![Message::ClockOffsetReport { offset_us: 500_000 }]
        );
        assert!(role.clock_sync().samples().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peer_disconnected_on_petition() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        sink.fail_for(addr(5000));

        role.open_sync_window().await;
        assert!(role.registry().resolve_identity(addr(5000)).is_err());
        assert!(!role.registry().get("alice").unwrap().online);
    }

    #[tokio::test]
    async fn test_offset_report_is_not_confirmed() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        role.open_sync_window().await;
        sink.clear();

        receive(&mut role, addr(5000), Message::ClockOffsetReport { offset_us: 1_000 }).await;
        assert!(sink.raw_to(addr(5000)).is_empty());
        assert_eq!(role.clock_sync().samples().len(), 1);

        // 다른 메시지는 그대로 확인 응답
        receive(&mut role, addr(5000), Message::GetConnected { users: vec![] }).await;
        assert_eq!(sink.raw_to(addr(5000))[0], CONFIRMATION_FRAME);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_releases_address() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        login(&mut role, 5001, "bob").await;
        sink.fail_for(addr(5001));

        receive(
            &mut role,
            addr(5000),
            Message::DirectMessage {
                from: String::new(),
                to: "bob".into(),
                message: "are you there".into(),
            },
        )
        .await;

        let bob = role.registry().get("bob").unwrap();
        assert!(!bob.online);
        assert_eq!(bob.pending.len(), 1);
        assert!(role.registry().resolve_identity(addr(5001)).is_err());

        // 끊긴 주소에서 온 메시지는 로그인 요청으로 거부
        sink.heal(addr(5001));
        sink.clear();
        receive(
            &mut role,
            addr(5001),
            Message::Broadcast {
                from: String::new(),
                message: "hi".into(),
            },
        )
        .await;
        assert_eq!(
            sink.messages_to(addr(5001)),
            vec![Message::error(LOGIN_REQUIRED)]
        );
        assert!(sink.messages_to(addr(5000)).is_empty());

        sink.clear();
        login(&mut role, 5001, "bob").await;
        assert_eq!(
            sink.messages_to(addr(5001)),
            vec![
                Message::LoginResponse { node_id: 5001 },
                Message::DirectMessage {
                    from: "alice".into(),
                    to: "bob".into(),
                    message: "are you there".into(),
                },
            ]
        );
        assert!(role.registry().get("bob").unwrap().online);
    }

    #[tokio::test]
    async fn test_address_announcements() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        login(&mut role, 5001, "bob").await;
        sink.clear();

        role.announce_addresses().await;
        assert_eq!(
            sink.messages_to(addr(5000)),
            vec![Message::AddressAnnouncement { node_id: 5001 }]
        );
        assert_eq!(
            sink.messages_to(addr(5001)),
            vec![Message::AddressAnnouncement { node_id: 5000 }]
        );
    }

    #[tokio::test]
    async fn test_unexpected_kind_gets_error() {
        let (mut role, sink, _) = server();
        login(&mut role, 5000, "alice").await;
        sink.clear();

        receive(&mut role, addr(5000), Message::VoteAnnouncement { candidate: 9 }).await;
        assert!(matches!(
            sink.messages_to(addr(5000)).as_slice(),
            [Message::Error { .. }]
        ));
    }
}
