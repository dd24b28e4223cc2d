//! 신뢰성 전달 계층
//!
//! - 서버 → 피어: 전송 재시도, 실패 시 세션 대기 큐에 보관
//! - 클라이언트 → 서버: 확인 응답 대기, 연속 타임아웃이 쌓이면 선거 트리거

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::election::ElectionHandle;
use crate::registry::Session;
use crate::stats::DeliveryStats;
use crate::transport::DatagramSink;
use crate::{Config, Error, Result};

/// `deliver_or_queue` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 즉시 전송됨
    Delivered,
    /// 대기 큐에 보관됨
    Queued,
}

/// 재시도 기반 전송기
pub struct Delivery<S> {
    sink: S,
    max_retry: u32,
    retry_interval: Duration,
    stats: Arc<DeliveryStats>,
}

impl<S: DatagramSink> Delivery<S> {
    pub fn new(sink: S, config: &Config) -> Self {
        Self {
            sink,
            max_retry: config.max_retry.max(1),
            retry_interval: config.retry_interval,
            stats: Arc::new(DeliveryStats::new()),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn stats(&self) -> &Arc<DeliveryStats> {
        &self.stats
    }

    /// 최대 `max_retry`회 전송 시도
    ///
    /// 시도 사이에 `retry_interval`만큼 대기, 전송 계층이 쓰기를 받아들이면 성공
    pub async fn send_reliable(&self, target: SocketAddr, payload: &[u8]) -> Result<()> {
        for attempt in 1..=self.max_retry {
            match self.sink.send_to(target, payload).await {
                Ok(()) => {
                    self.stats.record_sent();
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        "전송 실패 ({}/{}) → {}: {}",
                        attempt, self.max_retry, target, e
                    );
                    if attempt < self.max_retry {
                        self.stats.record_retry();
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }

        self.stats.record_failed();
        Err(Error::DeliveryFailed {
            addr: target,
            attempts: self.max_retry,
        })
    }

    /// 온라인이면 즉시 전송, 실패하거나 오프라인이면 대기 큐에 보관
    ///
    /// 전송 실패 시 세션은 오프라인으로 표시됨.
    /// 주소 인덱스는 레지스트리 소유이므로 호출자가 `disconnect`로 정리
    pub async fn deliver_or_queue(&self, session: &mut Session, payload: Bytes) -> DeliveryOutcome {
        if session.online {
            match self.send_reliable(session.address, &payload).await {
                Ok(()) => return DeliveryOutcome::Delivered,
                Err(e) => {
                    warn!("{} 전달 실패, 오프라인 처리: {}", session.identity, e);
                    session.online = false;
                }
            }
        }

        session.pending.push_back(payload);
        self.stats.record_queued();
        DeliveryOutcome::Queued
    }

    /// 재접속한 세션에 대기 페이로드를 순서대로 전달
    ///
    /// 중간에 실패하면 나머지는 같은 순서로 다시 큐에 들어감
    pub async fn flush_pending(&self, session: &mut Session, pending: Vec<Bytes>) -> usize {
        let total = pending.len();
        let mut delivered = 0;

        for payload in pending {
            if self.deliver_or_queue(session, payload).await == DeliveryOutcome::Delivered {
                delivered += 1;
            }
        }

        self.stats.record_flushed(delivered);
        if total > 0 {
            info!("{}: 대기 메시지 {}/{} 전달", session.identity, delivered, total);
        }
        delivered
    }
}

/// 차단 여부 확인
///
/// `true`면 전달을 조용히 생략해야 함
pub fn check_blocked(session: &Session, sender: &str) -> bool {
    session.has_blocked(sender)
}

/// 클라이언트 → 서버 링크
///
/// 서버는 오프셋 보고를 제외한 모든 데이터그램에 확인 응답을 보냄.
/// 확인 응답이 연속으로 오지 않으면 서버 장애로 판단
pub struct ServerLink<S> {
    delivery: Delivery<S>,
    server_addr: SocketAddr,
    confirmation_timeout: Duration,
    threshold: u32,
    timeouts_left: u32,
    confirmations: mpsc::Receiver<()>,
    election: ElectionHandle,
}

impl<S: DatagramSink> ServerLink<S> {
    pub fn new(
        sink: S,
        config: &Config,
        confirmations: mpsc::Receiver<()>,
        election: ElectionHandle,
    ) -> Self {
        let threshold = config.confirmation_failure_threshold.max(1);
        Self {
            delivery: Delivery::new(sink, config),
            server_addr: config.server_addr,
            confirmation_timeout: config.confirmation_timeout,
            threshold,
            timeouts_left: threshold,
            confirmations,
            election,
        }
    }

    pub fn stats(&self) -> &Arc<DeliveryStats> {
        self.delivery.stats()
    }

    /// 남은 타임아웃 허용 횟수
    pub fn timeouts_left(&self) -> u32 {
        self.timeouts_left
    }

    /// 서버로 전송 후 확인 응답 대기
    pub async fn send_awaiting_confirmation(&mut self, payload: &[u8]) -> Result<()> {
        // 이전 요청에 늦게 도착한 확인 응답 버리기
        while self.confirmations.try_recv().is_ok() {}

        if let Err(e) = self.delivery.send_reliable(self.server_addr, payload).await {
            self.record_failure();
            return Err(e);
        }

        match tokio::time::timeout(self.confirmation_timeout, self.confirmations.recv()).await {
            Ok(Some(())) => {
                self.delivery.stats().record_confirmation();
                self.timeouts_left = self.threshold;
                Ok(())
            }
            Ok(None) => Err(Error::ChannelError),
            Err(_) => {
                self.delivery.stats().record_confirmation_timeout();
                self.record_failure();
                Err(Error::ConfirmationTimeout)
            }
        }
    }

    fn record_failure(&mut self) {
        self.timeouts_left = self.timeouts_left.saturating_sub(1);
        warn!(
            "서버 {} 응답 없음 (남은 허용 횟수 {})",
            self.server_addr, self.timeouts_left
        );

        if self.timeouts_left == 0 && !self.election.is_voting() {
            info!("타임아웃 한도 도달, 서버 선거 시작");
            self.election.suspect_server();
        }
    }

    /// 송신 큐를 비우는 루프
    pub async fn run(mut self, mut outbound: mpsc::Receiver<Vec<u8>>) {
        while let Some(payload) = outbound.recv().await {
            if let Err(e) = self.send_awaiting_confirmation(&payload).await {
                debug!("서버 전송 실패: {}", e);
            }
        }
        info!("서버 링크 종료: {}", self.delivery.stats().snapshot().summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::testing::detached_election;
    use crate::registry::SessionRegistry;
    use crate::transport::testing::RecordingSink;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn registered(registry: &mut SessionRegistry, port: u16, name: &str) {
        registry.register_or_reconnect(addr(port), name, port as u64).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reliable_retries_exactly_max_retry() {
        let sink = RecordingSink::new();
        sink.fail_for(addr(7000));
        let delivery = Delivery::new(sink.clone(), &Config::default());

        let err = delivery.send_reliable(addr(7000), b"hi").await.unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed { attempts: 3, .. }));

        let attempts = sink.attempts.lock().clone();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        assert_eq!(delivery.stats().snapshot().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reliable_stops_on_first_success() {
        let sink = RecordingSink::new();
        let delivery = Delivery::new(sink.clone(), &Config::default());

        delivery.send_reliable(addr(7000), b"hi").await.unwrap();
        assert_eq!(sink.attempt_count(), 1);
        assert_eq!(sink.raw_to(addr(7000)), vec![b"hi".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_or_queue_buffers_on_failure() {
        let sink = RecordingSink::new();
        let delivery = Delivery::new(sink.clone(), &Config::default());
        let mut registry = SessionRegistry::new();
        registered(&mut registry, 7001, "bob");
        sink.fail_for(addr(7001));

        let session = registry.get_mut("bob").unwrap();
        let outcome = delivery
            .deliver_or_queue(session, Bytes::from_static(b"one"))
            .await;
        assert_eq!(outcome, DeliveryOutcome::Queued);
        assert!(!session.online);

        // 오프라인 세션은 전송 시도 없이 바로 큐에 들어감
        sink.clear();
        let outcome = delivery
            .deliver_or_queue(session, Bytes::from_static(b"two"))
            .await;
        assert_eq!(outcome, DeliveryOutcome::Queued);
        assert_eq!(sink.attempt_count(), 0);
        assert_eq!(session.pending, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_flushes_in_fifo_order_before_new_traffic() {
        let sink = RecordingSink::new();
        let delivery = Delivery::new(sink.clone(), &Config::default());
        let mut registry = SessionRegistry::new();
        registered(&mut registry, 7002, "carol");
        registry.disconnect(addr(7002));

        for payload in ["a", "b", "c"] {
            let session = registry.get_mut("carol").unwrap();
            delivery
                .deliver_or_queue(session, Bytes::from(payload.as_bytes().to_vec()))
                .await;
        }

        let registration = registry.register_or_reconnect(addr(7003), "carol", 1).unwrap();
        let session = registry.get_mut("carol").unwrap();
        let delivered = delivery.flush_pending(session, registration.pending).await;
        delivery
            .deliver_or_queue(session, Bytes::from_static(b"new"))
            .await;

        assert_eq!(delivered, 3);
        assert_eq!(
            sink.raw_to(addr(7003)),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"new".to_vec()]
        );
        assert!(session.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_failure_requeues_remaining_in_order() {
        let sink = RecordingSink::new();
        let delivery = Delivery::new(sink.clone(), &Config::default());
        let mut registry = SessionRegistry::new();
        registered(&mut registry, 7004, "dave");
        sink.fail_for(addr(7004));

        let session = registry.get_mut("dave").unwrap();
        let pending = vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")];
        let delivered = delivery.flush_pending(session, pending.clone()).await;

        assert_eq!(delivered, 0);
        assert_eq!(session.pending, pending);
    }

    #[test]
    fn test_block_is_one_directional() {
        let mut registry = SessionRegistry::new();
        registered(&mut registry, 7005, "alice");
        registered(&mut registry, 7006, "bob");
        registry.block("alice", "bob").unwrap();

        // bob → alice 차단, alice → bob 허용
        assert!(check_blocked(registry.get("alice").unwrap(), "bob"));
        assert!(!check_blocked(registry.get("bob").unwrap(), "alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_resets_counter() {
        let sink = RecordingSink::new();
        let (election, _events) = detached_election();
        let (confirm_tx, confirm_rx) = mpsc::channel(4);
        let mut link = ServerLink::new(sink.clone(), &Config::default(), confirm_rx, election);

        assert!(matches!(
            link.send_awaiting_confirmation(b"x").await,
            Err(Error::ConfirmationTimeout)
        ));
        assert_eq!(link.timeouts_left(), 2);

        confirm_tx.send(()).await.unwrap();
        // 오래된 확인 응답은 버려지므로 전송 이후에 도착하도록 함
        let confirmer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            confirm_tx.send(()).await.unwrap();
        });
        link.send_awaiting_confirmation(b"y").await.unwrap();
        confirmer.await.unwrap();

        assert_eq!(link.timeouts_left(), 3);
        assert_eq!(link.stats().snapshot().confirmations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_awaiting_confirmation_retries_writes() {
        let sink = RecordingSink::new();
        let config = Config::default();
        sink.fail_for(config.server_addr);
        let (election, _events) = detached_election();
        let (_confirm_tx, confirm_rx) = mpsc::channel(4);
        let mut link = ServerLink::new(sink.clone(), &config, confirm_rx, election);

        let err = link.send_awaiting_confirmation(b"x").await.unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed { attempts: 3, .. }));

        let attempts = sink.attempts.lock().clone();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        assert_eq!(link.timeouts_left(), 2);
    }
}
