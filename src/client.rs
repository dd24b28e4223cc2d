//! 클라이언트 역할
//!
//! - 서버로 가는 메시지는 `ServerLink`가 확인 응답을 기다리며 전송
//! - 서버에서 온 데이터그램은 확인 응답, 시계 동기화, 주소 공지, 나머지 이벤트로 분류

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::LogicalClock;
use crate::delivery::ServerLink;
use crate::election::ElectionHandle;
use crate::message::{is_confirmation, FileChunk, Message};
use crate::transport::{Datagram, DatagramSink, DatagramStream, Transport};
use crate::{Config, Error, NodeId, Result};

/// 사용자에게 보여줄 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    LoggedIn { node_id: NodeId },
    Broadcast { from: String, message: String },
    Direct { from: String, message: String },
    Connected(Vec<String>),
    File(FileChunk),
    ServerError(String),
    ClockCorrected { adjustment_us: i64, now_us: i64 },
}

/// 서버로 메시지를 보내는 핸들
#[derive(Clone)]
pub struct ClientHandle {
    outbound: mpsc::Sender<Vec<u8>>,
}

impl ClientHandle {
    pub fn new(outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self { outbound }
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| Error::ChannelError)
    }
}

/// 서버에서 온 데이터그램 처리기
pub struct ClientRole<S> {
    sink: S,
    clock: LogicalClock,
    confirmations: mpsc::Sender<()>,
    election: ElectionHandle,
    events: mpsc::Sender<ClientEvent>,
}

impl<S: DatagramSink> ClientRole<S> {
    pub fn new(
        sink: S,
        clock: LogicalClock,
        confirmations: mpsc::Sender<()>,
        election: ElectionHandle,
        events: mpsc::Sender<ClientEvent>,
    ) -> Self {
        Self {
            sink,
            clock,
            confirmations,
            election,
            events,
        }
    }

    pub async fn handle_datagram(&self, datagram: Datagram) {
        if is_confirmation(&datagram.payload) {
            // 기다리는 쪽이 없으면 버림
            let _ = self.confirmations.try_send(());
            return;
        }

        let message = match Message::from_bytes(&datagram.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("서버 메시지 해석 실패 ({}): {}", datagram.source, e);
                return;
            }
        };

        let event = match message {
            Message::ClockSyncPetition { server_time_us } => {
                self.report_offset(datagram.source, server_time_us).await;
                return;
            }
            Message::ClockOffsetReport { offset_us } => {
                let now_us = self.clock.apply_adjustment(offset_us);
                debug!("시계 보정 적용: {}us → {}", offset_us, now_us);
                ClientEvent::ClockCorrected {
                    adjustment_us: offset_us,
                    now_us,
                }
            }
            Message::AddressAnnouncement { node_id } => {
                self.election.announce_peer(node_id);
                return;
            }
            Message::LoginResponse { node_id } => ClientEvent::LoggedIn { node_id },
            Message::Broadcast { from, message } => ClientEvent::Broadcast { from, message },
            Message::DirectMessage { from, message, .. } => ClientEvent::Direct { from, message },
            Message::GetConnected { users } => ClientEvent::Connected(users),
            Message::FileChunk(chunk) => ClientEvent::File(chunk),
            Message::Error { message } => ClientEvent::ServerError(message),
            other => {
                debug!("클라이언트가 처리하지 않는 메시지: {:?}", other.msg_type());
                return;
            }
        };

        if self.events.send(event).await.is_err() {
            debug!("이벤트 수신자 없음");
        }
    }

    /// 오프셋 보고 (재시도 없음, 유실되면 이번 라운드만 빠짐)
    async fn report_offset(&self, server: SocketAddr, server_time_us: i64) {
        let report = Message::ClockOffsetReport {
            offset_us: self.clock.offset_from(server_time_us),
        };
        let result = match report.to_bytes() {
            Ok(bytes) => self.sink.send_to(server, &bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!("오프셋 보고 실패: {}", e);
        }
    }

    pub async fn run(self, mut inbound: DatagramStream) {
        while let Some(item) = inbound.recv().await {
            match item {
                Ok(datagram) => self.handle_datagram(datagram).await,
                Err(e) => {
                    warn!("클라이언트 수신 종료: {}", e);
                    break;
                }
            }
        }
    }
}

/// 실행 중인 클라이언트
pub struct ClientSession {
    pub handle: ClientHandle,
    pub events: mpsc::Receiver<ClientEvent>,
    pub clock: LogicalClock,
    transport: Arc<Transport>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientSession {
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        self.transport.close(timeout).await
    }
}

/// 클라이언트 소켓을 열고 링크, 수신 루프, 논리 시계를 시작
pub async fn connect(
    config: &Config,
    election: ElectionHandle,
    clock: LogicalClock,
) -> Result<ClientSession> {
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let transport = Arc::new(Transport::bind(bind_addr).await?);
    let inbound = transport.listen(config.recv_buffer_size, config.channel_capacity)?;

    let (confirm_tx, confirm_rx) = mpsc::channel(config.channel_capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity);
    let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);

    let link = ServerLink::new(transport.clone(), config, confirm_rx, election.clone());
    let role = ClientRole::new(transport.clone(), clock.clone(), confirm_tx, election, events_tx);

    let tasks = vec![
        tokio::spawn(link.run(outbound_rx)),
        tokio::spawn(role.run(inbound)),
        clock.spawn_ticker(config.clock_tick),
    ];

    info!(
        "클라이언트 시작: {} → 서버 {}",
        transport.local_addr(),
        config.server_addr
    );

    Ok(ClientSession {
        handle: ClientHandle::new(outbound_tx),
        events: events_rx,
        clock,
        transport,
        tasks,
    })
}
