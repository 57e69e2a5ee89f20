//! 서버 컨텍스트와 데이터그램 디스패치
//!
//! 소켓은 호출자 몫이다. 수신 데이터그램을 handle_datagram으로 넘기면
//! 타입별로 세션 메일박스나 인바운드 풀로 보내고, 송신은 outbound
//! 채널로 나간다. 질의가 처음 온 주소마다 배포 태스크를 하나 띄운다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::StreamConfig;
use crate::distributor::{run_distributor, SessionCmd};
use crate::error::{Error, Result};
use crate::frustum::Cube;
use crate::inbound::InboundPool;
use crate::stats::ServerCounters;
use crate::tree::{ElementId, WorldContent};
use crate::wire::{
    decode_nack_body, now_us, Datagram, PacketHeader, PacketKind, QueryMessage,
    PACKET_HEADER_SIZE,
};

/// 삭제 로그 항목
#[derive(Debug, Clone, Copy)]
pub struct DeletionRecord {
    pub id: ElementId,
    pub at_us: u64,
}

/// 세션 핸들 (배포 태스크 메일박스)
pub struct SessionHandle {
    pub client_id: u64,
    pub mailbox: mpsc::Sender<SessionCmd>,
}

/// 전 태스크가 공유하는 서버 상태
pub struct ServerContext {
    /// 스트림 설정
    pub config: StreamConfig,

    /// 공유 컨텐츠 트리
    pub tree: Arc<RwLock<dyn WorldContent>>,

    /// 루트 셀 (불변 기하, 락 없이 쓰도록 캐시)
    root_cube: Cube,

    /// 송신 채널 (소켓 태스크가 소비)
    outbound: mpsc::Sender<Datagram>,

    /// 전역 카운터
    pub counters: ServerCounters,

    sessions: DashMap<SocketAddr, SessionHandle>,
    next_client_id: AtomicU64,
    global_window: AtomicU32,
    deletions: Mutex<Vec<DeletionRecord>>,
    shutdown: AtomicBool,
}

impl ServerContext {
    pub fn new(
        config: StreamConfig,
        tree: Arc<RwLock<dyn WorldContent>>,
        outbound: mpsc::Sender<Datagram>,
    ) -> Self {
        let root_cube = tree.read().root_cube();
        Self {
            config,
            tree,
            root_cube,
            outbound,
            counters: ServerCounters::new(),
            sessions: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            global_window: AtomicU32::new(0),
            deletions: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn root_cube(&self) -> Cube {
        self.root_cube
    }

    /// 송신 시도. 큐가 가득하면 버리고 false.
    pub fn send_datagram(&self, datagram: Datagram) -> bool {
        let size = datagram.bytes.len();
        match self.outbound.try_send(datagram) {
            Ok(()) => {
                ServerCounters::add(&self.counters.packets_out, 1);
                ServerCounters::add(&self.counters.bytes_out, size as u64);
                true
            }
            Err(_) => {
                warn!("송신 큐 포화, 패킷 버림");
                false
            }
        }
    }

    /// 서버 전체 인터벌 송신 한도에서 슬롯 하나 획득
    pub fn try_acquire_send_slot(&self) -> bool {
        let cap = self.config.server_packets_per_interval();
        self.global_window
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                if used < cap {
                    Some(used + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// 인터벌 경계에서 전역 윈도우 리셋
    pub fn reset_global_window(&self) {
        self.global_window.store(0, Ordering::Relaxed);
    }

    /// 원소 삭제 기록 (편집 스레드가 호출)
    pub fn record_deletion(&self, id: ElementId, at_us: u64) {
        let horizon_us = self.config.deletion_horizon_ms * 1000;
        let mut log = self.deletions.lock();
        log.push(DeletionRecord { id, at_us });
        // 지평선 밖 항목 제거
        let cutoff = at_us.saturating_sub(horizon_us);
        log.retain(|record| record.at_us >= cutoff);
    }

    /// 워터마크 이후 삭제 항목. (ID들, 새 워터마크)를 반환한다.
    ///
    /// limit을 넘어도 같은 시각 항목은 끝까지 포함해서 워터마크
    /// 전진으로 동일 시각 항목이 누락되지 않게 한다.
    pub fn deletions_since(&self, watermark_us: u64, limit: usize) -> (Vec<ElementId>, u64) {
        let log = self.deletions.lock();
        let mut ids = Vec::new();
        let mut new_watermark = watermark_us;
        for record in log.iter() {
            if record.at_us <= watermark_us {
                continue;
            }
            if ids.len() >= limit && record.at_us > new_watermark {
                break;
            }
            ids.push(record.id);
            new_watermark = record.at_us;
        }
        (ids, new_watermark)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_mailbox(&self, addr: &SocketAddr) -> Option<mpsc::Sender<SessionCmd>> {
        self.sessions.get(addr).map(|h| h.mailbox.clone())
    }

    pub fn remove_session(&self, addr: &SocketAddr) {
        self.sessions.remove(addr);
    }

    /// 종료 시작. 처음 호출이면 true.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// 모든 세션에 정지 명령
    pub fn broadcast_stop(&self) {
        for entry in self.sessions.iter() {
            let _ = entry.mailbox.try_send(SessionCmd::Stop);
        }
    }
}

/// 옥트리 스트림 서버
pub struct Server {
    ctx: Arc<ServerContext>,
    inbound: InboundPool,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// 서버 기동. 송신 데이터그램을 소비할 수신단을 함께 돌려준다.
    ///
    /// tokio 런타임 안에서 불러야 한다.
    pub fn start(
        config: StreamConfig,
        tree: Arc<RwLock<dyn WorldContent>>,
    ) -> (Self, mpsc::Receiver<Datagram>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_capacity);
        let ctx = Arc::new(ServerContext::new(config, tree, outbound_tx));
        let inbound = InboundPool::start(ctx.clone());

        let mut server = Self {
            ctx,
            inbound,
            tasks: Vec::new(),
        };
        server.spawn_maintenance();
        (server, outbound_rx)
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    fn spawn_maintenance(&mut self) {
        // 인터벌마다 전역 송신 윈도우 리셋
        let ctx = self.ctx.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ctx.config.interval());
            loop {
                ticker.tick().await;
                if ctx.is_shutdown() {
                    break;
                }
                ctx.reset_global_window();
            }
        }));

        // 편집 스트림 누락 스캔 작업 주입
        let ctx = self.ctx.clone();
        let jobs = self.inbound.job_sender();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(ctx.config.nack_scan_interval_ms));
            loop {
                ticker.tick().await;
                if ctx.is_shutdown() {
                    break;
                }
                if jobs.send(crate::inbound::Job::EmitNacks).is_err() {
                    break;
                }
            }
        }));

        // 주기 요약 로그
        let ctx = self.ctx.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if ctx.is_shutdown() {
                    break;
                }
                info!("{}", ctx.counters.summary(ctx.session_count()));
            }
        }));
    }

    /// 수신 데이터그램 한 건 처리
    pub fn handle_datagram(&self, from: SocketAddr, bytes: Bytes) -> Result<()> {
        ServerCounters::add(&self.ctx.counters.packets_in, 1);
        ServerCounters::add(&self.ctx.counters.bytes_in, bytes.len() as u64);

        let header = PacketHeader::from_bytes(&bytes)?;
        let kind = header.packet_kind()?;
        match kind {
            PacketKind::Query => {
                let query = QueryMessage::from_bytes(&bytes[PACKET_HEADER_SIZE..])?;
                let mailbox = self.ensure_session(from);
                if mailbox.try_send(SessionCmd::Query(query)).is_err() {
                    warn!(%from, "세션 메일박스 포화, 질의 버림");
                }
            }
            PacketKind::StreamNack => {
                ServerCounters::add(&self.ctx.counters.nacks_in, 1);
                let sequences = decode_nack_body(&bytes[PACKET_HEADER_SIZE..])?;
                match self.ctx.session_mailbox(&from) {
                    Some(mailbox) => {
                        if mailbox.try_send(SessionCmd::Nack(sequences)).is_err() {
                            warn!(%from, "세션 메일박스 포화, NACK 버림");
                        }
                    }
                    None => return Err(Error::SessionNotFound { addr: from }),
                }
            }
            kind if kind.is_edit() => {
                self.inbound.submit(from, header, bytes, now_us());
            }
            other => {
                warn!(%from, ?other, "서버가 처리하지 않는 패킷 타입");
            }
        }
        Ok(())
    }

    /// 주소에 대한 세션 확보. 없으면 배포 태스크를 띄운다.
    fn ensure_session(&self, addr: SocketAddr) -> mpsc::Sender<SessionCmd> {
        if let Some(mailbox) = self.ctx.session_mailbox(&addr) {
            return mailbox;
        }
        let client_id = self.ctx.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        self.ctx.sessions.insert(
            addr,
            SessionHandle {
                client_id,
                mailbox: tx.clone(),
            },
        );
        info!(%addr, client_id, "새 클라이언트 세션");
        tokio::spawn(run_distributor(self.ctx.clone(), addr, client_id, rx));
        tx
    }

    /// 전체 종료: 배포 태스크, 인바운드 풀, 유지 태스크를 정리한다.
    pub async fn shutdown(&mut self) {
        if self.ctx.begin_shutdown() {
            self.ctx.broadcast_stop();
            self.inbound.stop();
        }
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        info!("서버 종료 완료");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::VoxelTree;
    use crate::wire::encode_packet;

    fn test_tree() -> Arc<RwLock<dyn WorldContent>> {
        Arc::new(RwLock::new(VoxelTree::with_default_bounds()))
    }

    fn query_bytes() -> Bytes {
        let query = QueryMessage {
            position: [0.0, 0.0, 500.0],
            orientation: [0.0, 0.0, 0.0, 1.0],
            fov_deg: 90.0,
            near_clip: 0.1,
            far_clip: 2000.0,
            size_scale: 32768.0,
            boundary_level_adjust: 0,
            max_packets_per_second: 0,
        };
        let header = PacketHeader::new(PacketKind::Query, 0, 0);
        encode_packet(&header, &query.to_bytes())
    }

    #[tokio::test]
    async fn test_query_creates_single_session() {
        let (mut server, _rx) = Server::start(StreamConfig::default(), test_tree());
        let addr: SocketAddr = "127.0.0.1:5001".parse().unwrap();

        server.handle_datagram(addr, query_bytes()).unwrap();
        server.handle_datagram(addr, query_bytes()).unwrap();
        assert_eq!(server.context().session_count(), 1);

        let other: SocketAddr = "127.0.0.1:5002".parse().unwrap();
        server.handle_datagram(other, query_bytes()).unwrap();
        assert_eq!(server.context().session_count(), 2);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_nack_without_session_is_error() {
        let (mut server, _rx) = Server::start(StreamConfig::default(), test_tree());
        let addr: SocketAddr = "127.0.0.1:5003".parse().unwrap();

        let header = PacketHeader::new(PacketKind::StreamNack, 0, 0);
        let packet = encode_packet(&header, &crate::wire::encode_nack_body(&[1, 2]));
        let err = server.handle_datagram(addr, packet).unwrap_err();
        assert!(matches!(err, Error::SessionNotFound { .. }));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_truncated_datagram_is_error() {
        let (mut server, _rx) = Server::start(StreamConfig::default(), test_tree());
        let addr: SocketAddr = "127.0.0.1:5004".parse().unwrap();
        assert!(server
            .handle_datagram(addr, Bytes::from_static(&[1, 2, 3]))
            .is_err());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_send_window() {
        let mut config = StreamConfig::default();
        config.server_packets_per_second = config.intervals_per_second * 3;
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let ctx = ServerContext::new(config, test_tree(), outbound_tx);

        assert!(ctx.try_acquire_send_slot());
        assert!(ctx.try_acquire_send_slot());
        assert!(ctx.try_acquire_send_slot());
        assert!(!ctx.try_acquire_send_slot());

        ctx.reset_global_window();
        assert!(ctx.try_acquire_send_slot());
    }

    #[tokio::test]
    async fn test_deletion_log_watermark() {
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let ctx = ServerContext::new(StreamConfig::default(), test_tree(), outbound_tx);

        ctx.record_deletion(10, 1_000);
        ctx.record_deletion(20, 2_000);
        ctx.record_deletion(30, 2_000);
        ctx.record_deletion(40, 3_000);

        let (ids, watermark) = ctx.deletions_since(0, 2);
        // limit을 넘어도 같은 시각(2_000) 항목은 같이 나간다
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(watermark, 2_000);

        let (ids, watermark) = ctx.deletions_since(watermark, 10);
        assert_eq!(ids, vec![40]);
        assert_eq!(watermark, 3_000);

        let (ids, _) = ctx.deletions_since(watermark, 10);
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_deletion_log_horizon_prune() {
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let mut config = StreamConfig::default();
        config.deletion_horizon_ms = 1;
        let ctx = ServerContext::new(config, test_tree(), outbound_tx);

        ctx.record_deletion(1, 1_000);
        // 1ms 지평선: 10_000us 시점 기록이 1_000us 항목을 밀어낸다
        ctx.record_deletion(2, 10_000);
        let (ids, _) = ctx.deletions_since(0, 100);
        assert_eq!(ids, vec![2]);
    }
}
