//! 데이터그램 전송 계층
//!
//! - UDP 소켓 하나를 감싸는 얇은 래퍼
//! - 수신 루프 → `(payload, source, arrived_at)` 채널
//! - 읽기 에러 시 에러 값 하나를 흘려보내고 스트림 종료

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// 수신된 데이터그램
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Bytes,
    pub source: SocketAddr,
    pub arrived_at: SystemTime,
}

impl Datagram {
    pub fn new(payload: impl Into<Bytes>, source: SocketAddr) -> Self {
        Self {
            payload: payload.into(),
            source,
            arrived_at: SystemTime::now(),
        }
    }
}

/// 수신 스트림 (마지막 항목이 에러일 수 있음)
pub type DatagramStream = mpsc::Receiver<Result<Datagram>>;

/// 데이터그램 송신 추상화
///
/// 실제 소켓과 테스트용 메모리 버스가 같은 경로를 타도록 분리
pub trait DatagramSink: Send + Sync {
    fn send_to(
        &self,
        target: SocketAddr,
        bytes: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;
}

impl<T: DatagramSink> DatagramSink for Arc<T> {
    fn send_to(
        &self,
        target: SocketAddr,
        bytes: &[u8],
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).send_to(target, bytes)
    }
}

/// UDP 전송 핸들
pub struct Transport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Transport {
    /// 주소에 바인딩
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket)
    }

    /// 멀티캐스트 수신 소켓 생성
    ///
    /// 같은 호스트의 여러 노드가 그룹 포트를 공유하도록 SO_REUSEADDR 설정
    pub fn bind_multicast(group: SocketAddr) -> Result<Self> {
        let group_ip = match group.ip() {
            IpAddr::V4(ip) if ip.is_multicast() => ip,
            other => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("IPv4 멀티캐스트 주소 필요: {}", other),
                )))
            }
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port()).into())?;
        socket.join_multicast_v4(&group_ip, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!("멀티캐스트 그룹 참가: {}", group);
        Self::from_socket(socket)
    }

    fn from_socket(socket: UdpSocket) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            shutdown_tx,
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// 바인딩된 로컬 주소
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 수신 루프 시작
    ///
    /// 한 번만 호출 가능, 닫힌 뒤에는 재시작 불가
    pub fn listen(&self, buffer_size: usize, capacity: usize) -> Result<DatagramStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let mut reader = self.reader.lock();
        if reader.is_some() {
            return Err(Error::ChannelError);
        }

        let (tx, rx) = mpsc::channel(capacity);
        let socket = self.socket.clone();
        let local_addr = self.local_addr;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *reader = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; buffer_size];

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => break,

                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, source)) => {
                            let datagram = Datagram {
                                payload: Bytes::copy_from_slice(&buf[..len]),
                                source,
                                arrived_at: SystemTime::now(),
                            };
                            if tx.send(Ok(datagram)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("수신 에러 ({}): {}", local_addr, e);
                            let _ = tx
                                .send(Err(Error::Transport { addr: local_addr, source: e }))
                                .await;
                            break;
                        }
                    }
                }
            }

            debug!("수신 루프 종료: {}", local_addr);
        }));

        Ok(rx)
    }

    /// 데이터그램 전송
    pub async fn send_datagram(&self, target: SocketAddr, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        self.socket
            .send_to(bytes, target)
            .await
            .map(|_| ())
            .map_err(|source| Error::Transport {
                addr: target,
                source,
            })
    }

    /// 전송 계층 닫기
    ///
    /// 수신 루프가 `timeout` 안에 끝나지 않으면 에러 (재시도 가능)
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);

        let handle = self.reader.lock().take();
        let Some(mut handle) = handle else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => {
                info!("소켓 닫힘: {}", self.local_addr);
                Ok(())
            }
            Err(_) => {
                *self.reader.lock() = Some(handle);
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "수신 루프 종료 대기 타임아웃",
                )))
            }
        }
    }

    /// 닫힘 여부
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DatagramSink for Transport {
    fn send_to(
        &self,
        target: SocketAddr,
        bytes: &[u8],
    ) -> impl Future<Output = Result<()>> + Send {
        self.send_datagram(target, bytes)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
