//! 편집 수신 워커 풀.
//!
//! 편집 패킷의 역직렬화와 트리 쓰기 락은 배포 태스크의 틱과 분리해
//! 전용 스레드에서 처리한다. 작업은 crossbeam 채널로 넘기고, 발신자별로
//! 시퀀스 윈도우를 유지해 누락을 추적한다. 누락 스캔은 서버 유지
//! 태스크가 `EmitNacks` 작업으로 주기마다 요청한다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::server::ServerContext;
use crate::stats::{SenderStats, ServerCounters};
use crate::tree::ElementId;
use crate::wire::{
    encode_nack_body, encode_packet, Datagram, PacketHeader, PacketKind, PACKET_HEADER_SIZE,
};

/// 발신자 하나가 큐에 쌓을 수 있는 작업 상한
const MAX_QUEUED_PER_SENDER: usize = 128;

/// 이 시간 동안 조용한 발신자는 추적을 버린다
const SENDER_IDLE_SECS: u64 = 60;

/// 워커 풀 작업
#[derive(Debug)]
pub enum Job {
    /// 편집 패킷 1건 처리
    Edit {
        from: SocketAddr,
        header: PacketHeader,
        bytes: Bytes,
        arrived_us: u64,
    },
    /// 모든 발신자의 누락 시퀀스를 스캔해 NACK 전송
    EmitNacks,
    /// 워커 1개 종료
    Stop,
}

/// 워커들이 공유하는 상태
struct InboundShared {
    ctx: Arc<ServerContext>,
    /// 발신자별 수신 통계와 시퀀스 추적
    senders: DashMap<SocketAddr, Mutex<SenderStats>>,
    /// 발신자별 대기 중 작업 수 (폭주 차단용)
    queued: DashMap<SocketAddr, AtomicUsize>,
}

/// 편집 수신 풀 핸들
pub struct InboundPool {
    jobs: Sender<Job>,
    shared: Arc<InboundShared>,
    workers: Vec<JoinHandle<()>>,
}

impl InboundPool {
    /// 워커 스레드들을 띄운다.
    pub fn start(ctx: Arc<ServerContext>) -> Self {
        let (jobs, job_rx) = unbounded::<Job>();
        let shared = Arc::new(InboundShared {
            ctx,
            senders: DashMap::new(),
            queued: DashMap::new(),
        });
        let worker_count = shared.ctx.config.inbound_workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let shared = shared.clone();
            let job_rx = job_rx.clone();
            workers.push(std::thread::spawn(move || worker_loop(shared, job_rx)));
        }
        Self {
            jobs,
            shared,
            workers,
        }
    }

    /// 작업 주입용 채널 핸들
    pub fn job_sender(&self) -> Sender<Job> {
        self.jobs.clone()
    }

    /// 편집 패킷을 처리 큐에 넣는다.
    ///
    /// 발신자별 대기량이 상한을 넘으면 버린다. 느린 처리로 큐가 밀릴 때
    /// 한 발신자가 전체를 막지 못하게 한다.
    pub fn submit(
        &self,
        from: SocketAddr,
        header: PacketHeader,
        bytes: Bytes,
        arrived_us: u64,
    ) -> bool {
        {
            let queued = self.shared.queued.entry(from).or_default();
            if queued.load(Ordering::Relaxed) >= MAX_QUEUED_PER_SENDER {
                warn!(%from, "편집 큐 포화, 패킷 버림");
                return false;
            }
            queued.fetch_add(1, Ordering::Relaxed);
        }
        self.jobs
            .send(Job::Edit {
                from,
                header,
                bytes,
                arrived_us,
            })
            .is_ok()
    }

    /// 발신자 통계 열람 (관측용)
    pub fn with_sender<R>(
        &self,
        from: &SocketAddr,
        f: impl FnOnce(&SenderStats) -> R,
    ) -> Option<R> {
        self.shared.senders.get(from).map(|entry| f(&entry.lock()))
    }

    /// 워커들을 멈추고 합류한다.
    pub fn stop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.jobs.send(Job::Stop);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("편집 워커 join 실패");
            }
        }
    }
}

fn worker_loop(shared: Arc<InboundShared>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Edit {
                from,
                header,
                bytes,
                arrived_us,
            } => {
                process_edit(&shared, from, &header, &bytes, arrived_us);
                if let Some(count) = shared.queued.get(&from) {
                    // 휴면 정리와 겹쳐도 0 밑으로 내려가지 않게
                    let _ = count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                        current.checked_sub(1)
                    });
                }
            }
            Job::EmitNacks => emit_nacks(&shared),
            Job::Stop => break,
        }
    }
}

/// 편집 패킷 1건을 트리에 적용한다.
///
/// 레코드는 순차 적용하고, 파싱이 깨진 지점부터 잔여분은 버린다.
/// 중복 시퀀스는 이미 적용된 패킷의 재전송이므로 건너뛴다.
fn process_edit(
    shared: &InboundShared,
    from: SocketAddr,
    header: &PacketHeader,
    bytes: &Bytes,
    arrived_us: u64,
) {
    let started = Instant::now();
    let kind = match header.packet_kind() {
        Ok(kind) => kind,
        Err(error) => {
            warn!(%from, %error, "편집 패킷 타입 해석 실패");
            return;
        }
    };
    let payload = match bytes.get(PACKET_HEADER_SIZE..) {
        Some(payload) => payload,
        None => return,
    };

    // 발신자 통계 등록과 시퀀스 기록
    let config = &shared.ctx.config;
    let (event, skewed) = {
        let entry = shared.senders.entry(from).or_insert_with(|| {
            Mutex::new(SenderStats::new(
                config.sequence_window_capacity,
                config.max_reasonable_gap,
            ))
        });
        let mut stats = entry.lock();
        let transit_us = arrived_us.saturating_sub(header.sent_at_us);
        stats.record_packet(bytes.len(), transit_us);
        let skewed = header.sent_at_us > arrived_us;
        if skewed {
            stats.clock_skews += 1;
        }
        (stats.sequences.record(header.sequence), skewed)
    };
    if event == crate::sequence::SequenceEvent::Duplicate {
        debug!(%from, sequence = header.sequence, "중복 편집 패킷 무시");
        return;
    }
    // 시계가 앞선 발신자는 도착 시각을 변경 시각으로 쓴다
    let timestamp_us = if skewed {
        debug!(%from, sent_at_us = header.sent_at_us, "미래 타임스탬프 보정");
        arrived_us
    } else {
        header.sent_at_us
    };

    // 트리 쓰기 락 아래에서 레코드 순차 적용
    let lock_started = Instant::now();
    let mut tree = shared.ctx.tree.write();
    let lock_wait_us = lock_started.elapsed().as_micros() as u64;
    if !tree.handles_edit(kind) {
        drop(tree);
        warn!(%from, ?kind, "트리가 처리하지 않는 편집 타입");
        return;
    }
    let mut offset = 0usize;
    let mut applied = 0u64;
    let mut failed = 0u64;
    let mut deletions: Vec<ElementId> = Vec::new();
    while offset < payload.len() {
        match tree.apply_edit(kind, &payload[offset..], timestamp_us) {
            Ok(result) => {
                if result.consumed == 0 {
                    break;
                }
                offset += result.consumed;
                applied += 1;
                if let Some(id) = result.deleted_id {
                    deletions.push(id);
                }
            }
            Err(error) => {
                warn!(%from, %error, offset, "편집 레코드 적용 실패, 잔여분 폐기");
                failed += 1;
                break;
            }
        }
    }
    drop(tree);

    // 삭제 로그는 트리 락 밖에서 기록
    for id in &deletions {
        shared.ctx.record_deletion(*id, timestamp_us);
    }

    let process_us = started.elapsed().as_micros() as u64;
    if let Some(entry) = shared.senders.get(&from) {
        let mut stats = entry.lock();
        stats.edits_applied += applied;
        stats.edits_failed += failed;
        stats.record_process(process_us, lock_wait_us);
    }
    ServerCounters::add(&shared.ctx.counters.edits_applied, applied);
    ServerCounters::add(&shared.ctx.counters.edits_failed, failed);
}

/// 모든 발신자의 누락 시퀀스를 스캔해 NACK을 보낸다.
///
/// 아직 처리 안 된 패킷이 큐에 남은 발신자는 이번 스캔에서 제외한다.
/// 큐 안의 패킷이 누락으로 잘못 집계될 수 있어서다. 오래 조용한
/// 발신자는 추적에서 제거한다.
fn emit_nacks(shared: &InboundShared) {
    let idle_timeout = Duration::from_secs(SENDER_IDLE_SECS);
    let max_ids = shared
        .ctx
        .config
        .max_packet_size
        .saturating_sub(PACKET_HEADER_SIZE + 2)
        / 2;
    let mut idle: Vec<SocketAddr> = Vec::new();

    for entry in shared.senders.iter() {
        let from = *entry.key();
        // 처리 대기 중인 패킷이 있으면 누락 판정이 이르므로 건너뛴다
        let in_flight = shared
            .queued
            .get(&from)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0);
        if in_flight > 0 {
            continue;
        }
        let mut stats = entry.value().lock();
        if stats.is_idle(idle_timeout) {
            idle.push(from);
            continue;
        }
        stats.sequences.prune();
        let missing = stats.sequences.missing();
        if missing.is_empty() {
            continue;
        }
        let wanted = &missing[..missing.len().min(max_ids)];
        let sequence = stats.nacks_sent as u16;
        let nack_header = PacketHeader::new(PacketKind::EditNack, 0, sequence);
        let datagram = Datagram::new(from, encode_packet(&nack_header, &encode_nack_body(wanted)));
        debug!(%from, count = wanted.len(), "편집 누락 NACK 전송");
        if shared.ctx.send_datagram(datagram) {
            stats.nacks_sent += 1;
            ServerCounters::add(&shared.ctx.counters.nacks_out, 1);
        }
    }

    for from in idle {
        shared.senders.remove(&from);
        shared.queued.remove(&from);
        debug!(%from, "휴면 발신자 정리");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::tree::WorldContent;
    use crate::voxel::{encode_erase_record, encode_set_record, VoxelTree};
    use crate::wire::{decode_nack_body, now_us};
    use parking_lot::RwLock;
    use tokio::sync::mpsc;

    fn test_pool(
        config: StreamConfig,
    ) -> (
        InboundPool,
        Arc<ServerContext>,
        mpsc::Receiver<Datagram>,
        Arc<RwLock<VoxelTree>>,
    ) {
        let tree = Arc::new(RwLock::new(VoxelTree::with_default_bounds()));
        let shared: Arc<RwLock<dyn WorldContent>> = tree.clone();
        let (tx, rx) = mpsc::channel(64);
        let ctx = Arc::new(ServerContext::new(config, shared, tx));
        let pool = InboundPool::start(ctx.clone());
        (pool, ctx, rx, tree)
    }

    fn edit_datagram(kind: PacketKind, sequence: u16, record: &[u8]) -> (PacketHeader, Bytes) {
        let header = PacketHeader::new(kind, 0, sequence);
        let bytes = encode_packet(&header, record);
        (header, bytes)
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_edit_set_applies_to_tree() {
        let (mut pool, _ctx, _rx, tree) = test_pool(StreamConfig::default());
        let from: SocketAddr = "10.0.0.1:4000".parse().unwrap();

        let (header, bytes) = edit_datagram(
            PacketKind::EditSet,
            0,
            &encode_set_record(&[1, 2], [10, 20, 30]),
        );
        assert!(pool.submit(from, header, bytes, now_us()));

        assert!(wait_until(|| tree.read().voxel_at(&[1, 2]).is_some()));
        assert_eq!(tree.read().voxel_at(&[1, 2]), Some([10, 20, 30]));
        assert_eq!(
            pool.with_sender(&from, |stats| stats.edits_applied),
            Some(1)
        );
        pool.stop();
    }

    #[test]
    fn test_multiple_records_in_one_packet() {
        let (mut pool, _ctx, _rx, tree) = test_pool(StreamConfig::default());
        let from: SocketAddr = "10.0.0.1:4001".parse().unwrap();

        let mut body = encode_set_record(&[0], [1, 1, 1]);
        body.extend_from_slice(&encode_set_record(&[7, 7], [2, 2, 2]));
        let (header, bytes) = edit_datagram(PacketKind::EditSet, 0, &body);
        pool.submit(from, header, bytes, now_us());

        assert!(wait_until(|| tree.read().voxel_at(&[7, 7]).is_some()));
        assert_eq!(tree.read().voxel_at(&[0]), Some([1, 1, 1]));
        assert_eq!(
            pool.with_sender(&from, |stats| stats.edits_applied),
            Some(2)
        );
        pool.stop();
    }

    #[test]
    fn test_duplicate_sequence_not_reapplied() {
        let (mut pool, _ctx, _rx, tree) = test_pool(StreamConfig::default());
        let from: SocketAddr = "10.0.0.2:4000".parse().unwrap();

        let (header, bytes) =
            edit_datagram(PacketKind::EditSet, 0, &encode_set_record(&[3], [200, 0, 0]));
        pool.submit(from, header, bytes, now_us());
        assert!(wait_until(|| tree.read().voxel_at(&[3]).is_some()));

        // 같은 시퀀스의 재전송: 내용이 달라도 무시된다
        let (header, bytes) =
            edit_datagram(PacketKind::EditSet, 0, &encode_set_record(&[3], [0, 0, 200]));
        pool.submit(from, header, bytes, now_us());
        assert!(wait_until(|| {
            pool.with_sender(&from, |stats| stats.packets_received) == Some(2)
        }));

        assert_eq!(tree.read().voxel_at(&[3]), Some([200, 0, 0]));
        assert_eq!(
            pool.with_sender(&from, |stats| stats.edits_applied),
            Some(1)
        );
        pool.stop();
    }

    #[test]
    fn test_gap_produces_edit_nack() {
        let (mut pool, _ctx, mut rx, _tree) = test_pool(StreamConfig::default());
        let from: SocketAddr = "10.0.0.3:4000".parse().unwrap();

        let (header, bytes) =
            edit_datagram(PacketKind::EditSet, 0, &encode_set_record(&[0], [1, 1, 1]));
        pool.submit(from, header, bytes, now_us());
        // 1, 2를 건너뛴 시퀀스 3
        let (header, bytes) =
            edit_datagram(PacketKind::EditSet, 3, &encode_set_record(&[1], [1, 1, 1]));
        pool.submit(from, header, bytes, now_us());
        assert!(wait_until(|| {
            pool.with_sender(&from, |stats| stats.packets_received) == Some(2)
        }));

        pool.job_sender().send(Job::EmitNacks).unwrap();

        let mut nack = None;
        assert!(wait_until(|| {
            match rx.try_recv() {
                Ok(datagram) => {
                    nack = Some(datagram);
                    true
                }
                Err(_) => false,
            }
        }));
        let nack = nack.unwrap();
        assert_eq!(nack.dest, from);
        let header = PacketHeader::from_bytes(&nack.bytes).unwrap();
        assert_eq!(header.packet_kind().unwrap(), PacketKind::EditNack);
        let wanted = decode_nack_body(&nack.bytes[PACKET_HEADER_SIZE..]).unwrap();
        assert_eq!(wanted, vec![1, 2]);
        assert_eq!(pool.with_sender(&from, |stats| stats.nacks_sent), Some(1));
        pool.stop();
    }

    #[test]
    fn test_nack_scan_waits_for_queued_packets() {
        let (mut pool, _ctx, mut rx, _tree) = test_pool(StreamConfig::default());
        let from: SocketAddr = "10.0.0.6:4000".parse().unwrap();

        let (header, bytes) =
            edit_datagram(PacketKind::EditSet, 0, &encode_set_record(&[0], [1, 1, 1]));
        pool.submit(from, header, bytes, now_us());
        let (header, bytes) =
            edit_datagram(PacketKind::EditSet, 3, &encode_set_record(&[1], [1, 1, 1]));
        pool.submit(from, header, bytes, now_us());
        assert!(wait_until(|| {
            pool.with_sender(&from, |stats| stats.packets_received) == Some(2)
        }));
        // 워커의 대기량 감산까지 끝나기를 기다린다
        assert!(wait_until(|| {
            pool.shared
                .queued
                .get(&from)
                .map(|count| count.load(Ordering::Relaxed))
                == Some(0)
        }));

        // 대기 중인 패킷이 있는 것처럼 꾸미면 스캔이 이 발신자를 건너뛴다
        pool.shared
            .queued
            .entry(from)
            .or_default()
            .store(1, Ordering::Relaxed);
        pool.job_sender().send(Job::EmitNacks).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());

        // 큐가 비면 다음 스캔이 누락을 보고한다
        pool.shared
            .queued
            .entry(from)
            .or_default()
            .store(0, Ordering::Relaxed);
        pool.job_sender().send(Job::EmitNacks).unwrap();
        assert!(wait_until(|| rx.try_recv().is_ok()));
        pool.stop();
    }

    #[test]
    fn test_future_timestamp_clamped_to_arrival() {
        let (mut pool, _ctx, _rx, tree) = test_pool(StreamConfig::default());
        let from: SocketAddr = "10.0.0.4:4000".parse().unwrap();

        // 송신 시각이 10초 미래인 패킷
        let mut header = PacketHeader::new(PacketKind::EditSet, 0, 0);
        header.sent_at_us = now_us() + 10_000_000;
        let bytes = encode_packet(&header, &encode_set_record(&[5], [7, 7, 7]));
        let arrived = now_us();
        pool.submit(from, header, bytes, arrived);

        assert!(wait_until(|| tree.read().voxel_at(&[5]).is_some()));
        // 변경 시각은 도착 시각으로 내려간다
        assert!(tree.read().root().subtree_changed_at_us() <= now_us());
        assert_eq!(pool.with_sender(&from, |stats| stats.clock_skews), Some(1));
        pool.stop();
    }

    #[test]
    fn test_erase_records_deletion() {
        let (mut pool, ctx, _rx, tree) = test_pool(StreamConfig::default());
        let from: SocketAddr = "10.0.0.5:4000".parse().unwrap();

        let (header, bytes) =
            edit_datagram(PacketKind::EditSet, 0, &encode_set_record(&[2, 6], [5, 5, 5]));
        pool.submit(from, header, bytes, now_us());
        assert!(wait_until(|| tree.read().voxel_at(&[2, 6]).is_some()));

        let (header, bytes) = edit_datagram(PacketKind::EditErase, 1, &encode_erase_record(&[2, 6]));
        pool.submit(from, header, bytes, now_us());
        assert!(wait_until(|| tree.read().voxel_at(&[2, 6]).is_none()));

        // 삭제 로그에 남아 배포 측 삭제 목록으로 흘러간다
        let (ids, _) = ctx.deletions_since(0, 16);
        assert_eq!(ids, vec![crate::tree::pack_path(&[2, 6])]);
        pool.stop();
    }
}
