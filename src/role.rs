//! 역할 제어
//!
//! 한 프로세스에서 서버 인스턴스는 최대 하나.
//! 시작/중지 요청은 용량 1 채널로 받아 중복 요청은 합쳐짐

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{ClockSource, SystemClock};
use crate::server::ServerRole;
use crate::transport::Transport;
use crate::{Config, Error, Result};

/// 서버 역할 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Stopped,
    Running(SocketAddr),
}

/// 역할 제어 핸들
#[derive(Clone)]
pub struct RoleHandle {
    start_tx: mpsc::Sender<SocketAddr>,
    stop_tx: mpsc::Sender<()>,
    state: watch::Receiver<RoleState>,
    failed_starts: Arc<AtomicU64>,
}

impl RoleHandle {
    /// 서버 시작 요청
    ///
    /// 이미 대기 중인 요청이 있으면 합쳐지고 `false` 반환
    pub fn request_start(&self, addr: SocketAddr) -> Result<bool> {
        match self.start_tx.try_send(addr) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(Error::ChannelError),
        }
    }

    /// 서버 중지 요청
    pub fn request_stop(&self) -> Result<bool> {
        match self.stop_tx.try_send(()) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(Error::ChannelError),
        }
    }

    pub fn state(&self) -> RoleState {
        *self.state.borrow()
    }

    /// 바인딩 실패 횟수
    pub fn failed_starts(&self) -> u64 {
        self.failed_starts.load(Ordering::Relaxed)
    }

    /// 조건을 만족하는 상태가 될 때까지 대기
    pub async fn wait_for(&self, mut predicate: impl FnMut(&RoleState) -> bool) -> RoleState {
        let mut state = self.state.clone();
        let result = match state.wait_for(|s| predicate(s)).await {
            Ok(current) => *current,
            Err(_) => self.state(),
        };
        result
    }
}

type CloseFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// 실행 중인 서버의 소켓
///
/// 중지할 때 `close`를 최대 `shutdown_retries`번 호출
pub(crate) trait ServerSocket: Send + Sync {
    fn close(&self, timeout: Duration) -> CloseFuture<'_>;
}

impl ServerSocket for Transport {
    fn close(&self, timeout: Duration) -> CloseFuture<'_> {
        Box::pin(Transport::close(self, timeout))
    }
}

struct RunningServer {
    addr: SocketAddr,
    socket: Arc<dyn ServerSocket>,
    task: JoinHandle<()>,
}

/// 역할 제어기
pub struct RoleController {
    config: Config,
    clock: Arc<dyn ClockSource>,
    start_rx: mpsc::Receiver<SocketAddr>,
    stop_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<RoleState>,
    failed_starts: Arc<AtomicU64>,
    running: Option<RunningServer>,
}

impl RoleController {
    pub fn new(config: Config) -> (Self, RoleHandle) {
        let (start_tx, start_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(RoleState::Stopped);
        let failed_starts = Arc::new(AtomicU64::new(0));

        let handle = RoleHandle {
            start_tx,
            stop_tx,
            state: state_rx,
            failed_starts: failed_starts.clone(),
        };

        let controller = Self {
            config,
            clock: Arc::new(SystemClock),
            start_rx,
            stop_rx,
            state_tx,
            failed_starts,
            running: None,
        };

        (controller, handle)
    }

    /// 서버 시계 교체
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// 요청 처리 루프
    ///
    /// 서버 소켓을 닫지 못하면 `ServerShutdownFault`로 종료
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                Some(addr) = self.start_rx.recv() => self.start(addr).await,
                Some(()) = self.stop_rx.recv() => self.stop().await?,
                else => break,
            }
        }

        self.stop().await
    }

    async fn start(&mut self, addr: SocketAddr) {
        if let Some(running) = &self.running {
            warn!("{}", Error::ServerAlreadyRunning(running.addr));
            return;
        }

        let transport = match Transport::bind(addr).await {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                self.failed_starts.fetch_add(1, Ordering::Relaxed);
                error!("서버 소켓 바인딩 실패 ({}): {}", addr, e);
                return;
            }
        };

        let inbound = match transport.listen(self.config.recv_buffer_size, self.config.channel_capacity) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.failed_starts.fetch_add(1, Ordering::Relaxed);
                error!("서버 수신 시작 실패 ({}): {}", addr, e);
                return;
            }
        };

        let local_addr = transport.local_addr();
        let server = ServerRole::new(transport.clone(), &self.config, self.clock.clone());
        let task = tokio::spawn(server.run(inbound));

        info!("서버 역할 시작: {}", local_addr);
        self.running = Some(RunningServer {
            addr: local_addr,
            socket: transport,
            task,
        });
        self.state_tx.send_replace(RoleState::Running(local_addr));
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            debug!("실행 중인 서버 없음");
            return Ok(());
        };

        let attempts = self.config.shutdown_retries.max(1);
        let mut closed = false;
        for attempt in 1..=attempts {
            match running.socket.close(self.config.confirmation_timeout).await {
                Ok(()) => {
                    closed = true;
                    break;
                }
                Err(e) => {
                    warn!("서버 소켓 닫기 실패 ({}/{}): {}", attempt, attempts, e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_interval).await;
                    }
                }
            }
        }

        if !closed {
            error!("서버 소켓을 닫지 못함: {}", running.addr);
            self.running = Some(running);
            return Err(Error::ServerShutdownFault { attempts });
        }

        if tokio::time::timeout(Duration::from_secs(1), running.task)
            .await
            .is_err()
        {
            debug!("서버 루프 종료 대기 시간 초과");
        }

        info!("서버 역할 중지: {}", running.addr);
        self.state_tx.send_replace(RoleState::Stopped);
        Ok(())
    }

    /// 대기 중인 시작 요청 꺼내기
    #[cfg(test)]
    pub(crate) fn take_start_request(&mut self) -> Option<SocketAddr> {
        self.start_rx.try_recv().ok()
    }

    /// 바인딩 없이 실행 중 상태로 만들기
    #[cfg(test)]
    pub(crate) fn install_running(&mut self, addr: SocketAddr, socket: Arc<dyn ServerSocket>) {
        self.running = Some(RunningServer {
            addr,
            socket,
            task: tokio::spawn(async {}),
        });
        self.state_tx.send_replace(RoleState::Running(addr));
    }
}
