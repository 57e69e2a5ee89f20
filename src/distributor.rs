//! 클라이언트별 배포 태스크.
//!
//! 세션마다 하나의 tokio 태스크가 돌면서 주기(tick)마다
//! 순회 배치 실행, 우선순위 큐 드레인, 패킷 패킹, 전송 예산 집행을
//! 수행한다. 외부 입력(질의, NACK, 정지)은 메일박스 채널로 받는다.
//!
//! 전송 순서는 재전송 → 장면 통계 → 옥트리 데이터 → 삭제 목록이며,
//! 모든 송신 패킷이 같은 시퀀스 공간을 쓰고 재전송 이력에 남는다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{debug, info, warn};

use crate::buffer::PacketBuffer;
use crate::server::ServerContext;
use crate::session::ClientSession;
use crate::stats::{SceneStats, ServerCounters};
use crate::traversal::{PrioritizedElement, TraversalMode};
use crate::tree::{descend, EncodeDetail, EncodeOutcome};
use crate::wire::{
    encode_deletion_body, encode_packet, now_us, Datagram, PacketHeader, PacketKind, QueryMessage,
    PACKET_HEADER_SIZE, SECTION_PREFIX_SIZE,
};

/// 배포 태스크 메일박스 명령.
#[derive(Debug)]
pub enum SessionCmd {
    /// 뷰 질의 갱신
    Query(QueryMessage),
    /// 스트림 NACK: 누락 시퀀스 재전송 요청
    Nack(Vec<u16>),
    /// 태스크 정지
    Stop,
}

/// 원소 하나를 패킹한 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackOutcome {
    /// 스테이징에 들어감
    Packed,
    /// 트리에서 사라진 원소
    Gone,
    /// 재시도 한도 초과 또는 패킷보다 큰 원소
    Skipped,
    /// 전송 예산 소진으로 비울 수 없음, 다음 주기로
    RateBlocked,
}

/// 클라이언트 하나를 담당하는 배포 루프.
///
/// 메일박스가 닫히거나 `Stop`을 받으면 세션을 정리하고 종료한다.
pub async fn run_distributor(
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    client_id: u64,
    mut mailbox: mpsc::Receiver<SessionCmd>,
) {
    let interval = ctx.config.interval();
    let mut inner = DistributorInner::new(ctx, addr, client_id);
    let mut next_tick = TokioInstant::now() + interval;
    info!(client_id, %addr, "배포 태스크 시작");

    loop {
        tokio::select! {
            cmd = mailbox.recv() => {
                match cmd {
                    Some(SessionCmd::Query(query)) => inner.on_query(&query),
                    Some(SessionCmd::Nack(sequences)) => inner.on_nack(&sequences),
                    Some(SessionCmd::Stop) | None => break,
                }
            }
            _ = sleep_until(next_tick) => {
                if inner.ctx.is_shutdown() {
                    break;
                }
                let started = Instant::now();
                inner.tick();
                let spent = started.elapsed();
                if spent >= interval {
                    warn!(
                        client_id,
                        spent_us = spent.as_micros() as u64,
                        "틱 과부하, 즉시 재실행"
                    );
                    next_tick = TokioInstant::now();
                } else {
                    // 절대 시각 기준으로 주기를 지켜 드리프트를 막는다
                    next_tick += interval;
                    let now = TokioInstant::now();
                    if next_tick < now {
                        next_tick = now + interval;
                    }
                }
            }
        }
    }

    inner.finish();
}

struct DistributorInner {
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    client_id: u64,
    session: ClientSession,
    /// 섹션 스테이징 버퍼. 압축 모드면 압축 후 크기 기준으로 담는다.
    buffer: PacketBuffer,
    /// 아직 못 보낸 직전 장면 통계
    pending_stats: Option<SceneStats>,
    ticks: u64,
}

impl DistributorInner {
    fn new(ctx: Arc<ServerContext>, addr: SocketAddr, client_id: u64) -> Self {
        let session = ClientSession::new(addr, client_id, &ctx.config);
        // 스테이징 목표: 압축 모드면 길이 접두사와 압축 여유분을 뺀다
        let staging_target = if ctx.config.compress {
            ctx.config
                .payload_budget()
                .saturating_sub(SECTION_PREFIX_SIZE + ctx.config.compress_padding)
        } else {
            ctx.config.payload_budget()
        };
        let buffer = PacketBuffer::new(ctx.config.compress, ctx.config.zstd_level, staging_target);
        Self {
            ctx,
            addr,
            client_id,
            session,
            buffer,
            pending_stats: None,
            ticks: 0,
        }
    }

    fn on_query(&mut self, query: &QueryMessage) {
        self.session.apply_query(query, &self.ctx.config);
    }

    fn on_nack(&mut self, sequences: &[u16]) {
        self.session.on_nack(sequences);
    }

    /// 한 주기의 전체 작업.
    fn tick(&mut self) {
        self.ticks += 1;
        let now = now_us();
        let budget = self.session.packets_per_interval();
        let mut sent = 0u32;

        // 1. 새 뷰 반영. 기존 패스와 충분히 비슷하면 패스를 유지한다.
        if let Some(view) = self.session.take_pending_view() {
            let similar = self.session.current_view().is_some_and(|current| {
                view.very_similar(
                    current,
                    self.ctx.config.view_position_epsilon,
                    self.ctx.config.view_angle_epsilon_deg,
                )
            });
            if !similar {
                // 새 장면이 이전 세대의 조립물과 한 패킷을 공유하면 안 된다.
                // 보낼 수 있는 만큼 내보내고 나머지는 버린다. 버려진 원소는
                // 다음 패스가 마지막 완료 뷰 기준으로 다시 고른다.
                if self.flush_staging(&mut sent, budget) {
                    let _ = self.send_pending(&mut sent, budget);
                }
                self.session.abandon_pass();
                self.session.queue.clear();
                self.session.pending.clear();
                self.buffer.reset();
            }
            self.session.set_current_view(view);
        }

        // 2. 재전송이 신규 데이터보다 우선
        self.service_nacks(&mut sent, budget);

        // 3. 패스 시작 판정
        let root_changed_us = self.ctx.tree.read().root().subtree_changed_at_us();
        if self.session.needs_pass(root_changed_us) {
            let previous = self.session.scene_stats;
            if let Some(mode) = self.session.begin_pass(self.ctx.root_cube(), now, &self.ctx.config)
            {
                // 새 세대가 열리면 직전 장면의 통계를 내보낼 차례다
                if mode != TraversalMode::Continuation && previous.packets > 0 {
                    self.pending_stats = Some(previous);
                }
            }
        }
        self.send_scene_stats(&mut sent, budget);

        // 4. 순회 배치. 읽기 락은 배치 동안만 잡는다.
        if self.session.has_active_pass() {
            let traversal_budget = Duration::from_micros(self.ctx.config.traversal_budget_us);
            let session = &mut self.session;
            if let Some(traversal) = session.traversal.as_mut() {
                let tree = self.ctx.tree.read();
                let (_outcome, visited) =
                    traversal.next_batch(tree.root(), &mut session.queue, traversal_budget);
                drop(tree);
                session.scene_stats.elements_visited += visited;
            }
        }

        // 5. 우선순위 큐 드레인 + 패킹
        let pack_started = Instant::now();
        self.drain_queue(&mut sent, budget);
        self.session.scene_stats.encode_us += pack_started.elapsed().as_micros() as u64;

        // 6. 패스 완료 판정: 순회가 끝났고 큐와 잔여물을 모두 흘려보냈을 때
        let drained = self.session.traversal.is_some()
            && !self.session.has_active_pass()
            && self.session.queue.is_empty();
        if drained && self.flush_staging(&mut sent, budget) && self.send_pending(&mut sent, budget)
        {
            let generation = self.session.scene_generation;
            self.session.complete_pass();
            debug!(client_id = self.client_id, generation, "패스 완료");
        }

        // 7. 주기적 추가 데이터
        if self.ticks % u64::from(self.ctx.config.extra_data_ticks.max(1)) == 0 {
            self.send_deletions(&mut sent, budget);
        }
    }

    /// NACK 큐를 비우며 재전송한다. 클라이언트 예산과 전역 슬롯을 모두 쓴다.
    fn service_nacks(&mut self, sent: &mut u32, budget: u32) {
        while *sent < budget && self.session.pending_resends() > 0 {
            if !self.ctx.try_acquire_send_slot() {
                return;
            }
            let (sequence, bytes) = match self.session.next_resend() {
                Some(hit) => hit,
                None => return,
            };
            self.session.stats.resent_packets += 1;
            ServerCounters::add(&self.ctx.counters.resent_packets, 1);
            debug!(client_id = self.client_id, sequence, "NACK 재전송");
            if !self.ctx.send_datagram(Datagram::new(self.addr, bytes)) {
                self.session.stats.dropped_sends += 1;
            }
            *sent += 1;
        }
    }

    /// 큐에서 원소를 꺼내 스테이징에 패킹한다.
    fn drain_queue(&mut self, sent: &mut u32, budget: u32) {
        loop {
            if self.session.queue.is_empty() {
                return;
            }
            // 조립 중인 패킷에 자투리 공간만 남았으면 먼저 내보낸다
            if !self.session.pending.is_empty()
                && self.session.pending.remaining() < self.ctx.config.min_packing_room
            {
                if !self.send_pending(sent, budget) {
                    return;
                }
            }
            let element = match self.session.queue.pop() {
                Some(element) => element,
                None => return,
            };
            match self.pack_element(&element, sent, budget) {
                PackOutcome::Packed => {
                    self.session.scene_stats.elements_sent += 1;
                    self.session.stats.elements_sent += 1;
                    ServerCounters::add(&self.ctx.counters.elements_sent, 1);
                }
                PackOutcome::Gone | PackOutcome::Skipped => {}
                PackOutcome::RateBlocked => {
                    // 예산 소진. 원소를 돌려놓고 다음 주기에 잇는다
                    self.session.queue.push(element);
                    return;
                }
            }
        }
    }

    /// 원소 하나를 비우기-재시도 루프로 패킹한다.
    ///
    /// 스테이징이 차서 안 들어가면 스테이징을 패킷으로 비우고 재시도하고,
    /// 빈 스테이징에도 안 들어가면 상세도를 낮춘다.
    fn pack_element(
        &mut self,
        element: &PrioritizedElement,
        sent: &mut u32,
        budget: u32,
    ) -> PackOutcome {
        let mut detail = EncodeDetail::Full;
        let mut attempts = 0u32;
        loop {
            let outcome = {
                let tree = self.ctx.tree.read();
                match descend(tree.root(), &element.path) {
                    None => return PackOutcome::Gone,
                    Some(node) => {
                        self.buffer.begin_section();
                        match node.encode_payload(&element.path, &mut self.buffer, detail) {
                            EncodeOutcome::Appended => {
                                self.buffer.end_section();
                                EncodeOutcome::Appended
                            }
                            EncodeOutcome::DidntFit => {
                                self.buffer.discard_section();
                                EncodeOutcome::DidntFit
                            }
                        }
                    }
                }
            };
            match outcome {
                EncodeOutcome::Appended => return PackOutcome::Packed,
                EncodeOutcome::DidntFit if self.buffer.has_content() => {
                    attempts += 1;
                    if attempts > self.ctx.config.packing_attempts {
                        warn!(
                            client_id = self.client_id,
                            depth = element.path.len(),
                            "패킹 재시도 한도 초과, 원소 스킵"
                        );
                        return PackOutcome::Skipped;
                    }
                    if !self.flush_staging(sent, budget) {
                        return PackOutcome::RateBlocked;
                    }
                }
                EncodeOutcome::DidntFit => {
                    if detail == EncodeDetail::Full {
                        detail = EncodeDetail::Minimal;
                    } else {
                        warn!(
                            client_id = self.client_id,
                            depth = element.path.len(),
                            "패킷 한도보다 큰 원소, 스킵"
                        );
                        return PackOutcome::Skipped;
                    }
                }
            }
        }
    }

    /// 스테이징을 마무리해 조립 중인 패킷에 옮긴다.
    ///
    /// 자리가 없으면 먼저 패킷을 전송한다. 전송 예산이 막히면 false를
    /// 돌려주고 스테이징은 그대로 둔다.
    fn flush_staging(&mut self, sent: &mut u32, budget: u32) -> bool {
        if !self.buffer.has_content() {
            return true;
        }
        let section_len = self.buffer.finalized_size();
        if !self.session.pending.has_room(section_len) {
            if !self.send_pending(sent, budget) {
                return false;
            }
        }
        let section = match self.buffer.finalize() {
            Ok(section) => section,
            Err(error) => {
                warn!(client_id = self.client_id, %error, "섹션 마무리 실패, 폐기");
                self.buffer.reset();
                return true;
            }
        };
        if !self.session.pending.append_section(&section) {
            warn!(
                client_id = self.client_id,
                size = section.len(),
                "빈 패킷에도 안 들어가는 섹션, 폐기"
            );
        }
        self.buffer.reset();
        true
    }

    /// 조립 중인 옥트리 패킷을 전송한다.
    ///
    /// 직전 전송과 내용이 같으면 억제 창 안에서는 보내지 않고 버린다.
    /// 예산이나 전역 슬롯이 막히면 false를 돌려주고 패킷은 유지한다.
    fn send_pending(&mut self, sent: &mut u32, budget: u32) -> bool {
        if self.session.pending.is_empty() {
            return true;
        }
        let window = Duration::from_millis(self.ctx.config.suppress_window_ms);
        if self
            .session
            .is_duplicate_within(self.session.pending.payload_bytes(), window)
        {
            self.session.pending.clear();
            self.session.duplicate_count += 1;
            self.session.stats.suppressed_duplicates += 1;
            ServerCounters::add(&self.ctx.counters.suppressed_duplicates, 1);
            debug!(client_id = self.client_id, "동일 내용 패킷 억제");
            return true;
        }
        if *sent >= budget {
            return false;
        }
        if !self.ctx.try_acquire_send_slot() {
            return false;
        }
        let sequence = self.session.next_sequence();
        let bytes = self.session.pending.finish(PacketKind::OctreeData, sequence);
        self.session.history.record(sequence, bytes.clone());
        self.session
            .note_payload_sent(bytes.slice(PACKET_HEADER_SIZE..));
        self.session.scene_stats.packets += 1;
        self.session.scene_stats.bytes += (bytes.len() - PACKET_HEADER_SIZE) as u64;
        self.session.stats.record_send(bytes.len());
        if !self.ctx.send_datagram(Datagram::new(self.addr, bytes)) {
            self.session.stats.dropped_sends += 1;
        }
        *sent += 1;
        true
    }

    /// 대기 중인 직전 장면 통계를 보낸다.
    ///
    /// 예산이나 전역 슬롯이 막히면 다음 주기로 미룬다. 그 사이 새 세대가
    /// 또 열리면 최신 통계로 덮인다.
    fn send_scene_stats(&mut self, sent: &mut u32, budget: u32) {
        let stats = match self.pending_stats {
            Some(stats) => stats,
            None => return,
        };
        if *sent >= budget || !self.ctx.try_acquire_send_slot() {
            return;
        }
        self.pending_stats = None;
        let sequence = self.session.next_sequence();
        let header = PacketHeader::new(PacketKind::SceneStats, 0, sequence);
        let bytes = encode_packet(&header, &stats.to_message().to_bytes());
        self.session.history.record(sequence, bytes.clone());
        debug!(
            client_id = self.client_id,
            generation = stats.scene_generation,
            packets = stats.packets,
            "장면 통계 전송"
        );
        if !self.ctx.send_datagram(Datagram::new(self.addr, bytes)) {
            self.session.stats.dropped_sends += 1;
        }
        *sent += 1;
    }

    /// 삭제 목록의 미전송 구간을 하나의 패킷으로 보낸다.
    ///
    /// 워터마크는 실제로 전송했을 때만 전진하므로 예산이나 슬롯이
    /// 막혀도 유실되지 않는다.
    fn send_deletions(&mut self, sent: &mut u32, budget: u32) {
        let max_ids = self
            .ctx
            .config
            .max_packet_size
            .saturating_sub(PACKET_HEADER_SIZE + 2)
            / 8;
        if max_ids == 0 {
            return;
        }
        let (ids, watermark) = self
            .ctx
            .deletions_since(self.session.deletion_watermark_us, max_ids);
        if ids.is_empty() {
            return;
        }
        if *sent >= budget || !self.ctx.try_acquire_send_slot() {
            return;
        }
        let sequence = self.session.next_sequence();
        let header = PacketHeader::new(PacketKind::DeletionList, 0, sequence);
        let bytes = encode_packet(&header, &encode_deletion_body(&ids));
        self.session.history.record(sequence, bytes.clone());
        self.session.deletion_watermark_us = watermark;
        debug!(
            client_id = self.client_id,
            count = ids.len(),
            "삭제 목록 전송"
        );
        if !self.ctx.send_datagram(Datagram::new(self.addr, bytes)) {
            self.session.stats.dropped_sends += 1;
        }
        *sent += 1;
    }

    fn finish(&mut self) {
        info!(
            client_id = self.client_id,
            addr = %self.addr,
            "세션 종료: {}",
            self.session.stats.summary()
        );
        self.ctx.remove_session(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::server::Server;
    use crate::tree::{pack_path, WorldContent};
    use crate::voxel::{encode_erase_record, encode_set_record, ElementRecord, VoxelTree};
    use crate::wire::{decode_deletion_body, encode_nack_body, SceneStatsMessage};
    use bytes::Bytes;
    use parking_lot::RwLock;
    use tokio::time::timeout;

    fn tiny_scene() -> Arc<RwLock<VoxelTree>> {
        let mut tree = VoxelTree::with_default_bounds();
        for octant in 0..4u8 {
            tree.set_voxel(&[octant], [octant, 0, 0], 1_000).unwrap();
        }
        Arc::new(RwLock::new(tree))
    }

    fn viewer_query() -> QueryMessage {
        // 원점을 바라보며 (0,0,500)에 선 뷰어, 항등 쿼터니언은 -Z 방향
        QueryMessage {
            position: [0.0, 0.0, 500.0],
            orientation: [0.0, 0.0, 0.0, 1.0],
            fov_deg: 90.0,
            near_clip: 0.1,
            far_clip: 2_000.0,
            size_scale: 0.0,
            boundary_level_adjust: 0,
            max_packets_per_second: 0,
        }
    }

    fn query_datagram() -> Bytes {
        let header = PacketHeader::new(PacketKind::Query, 0, 0);
        encode_packet(&header, &viewer_query().to_bytes())
    }

    /// 원하는 종류의 패킷이 올 때까지 수신하고, 1초(가상 시간) 안에
    /// 안 오면 None.
    async fn recv_kind(
        rx: &mut mpsc::Receiver<Datagram>,
        kind: PacketKind,
    ) -> Option<Datagram> {
        loop {
            let datagram = match timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(datagram)) => datagram,
                _ => return None,
            };
            let header = PacketHeader::from_bytes(&datagram.bytes).unwrap();
            if header.packet_kind().unwrap() == kind {
                return Some(datagram);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scene_splits_into_sequenced_packets() {
        // 패킷을 아주 작게 잡아 원소 5개가 두 패킷으로 나뉘게 한다.
        // 루트 레코드 3바이트 + 리프 레코드 7바이트 x 4, 페이로드 한도 22.
        let tree = tiny_scene();
        let shared: Arc<RwLock<dyn WorldContent>> = tree.clone();
        let mut config = StreamConfig::default();
        config.max_packet_size = 34;
        config.compress = false;
        let (mut server, mut rx) = Server::start(config, shared);

        let addr: SocketAddr = "127.0.0.1:6001".parse().unwrap();
        server.handle_datagram(addr, query_datagram()).unwrap();

        let first = recv_kind(&mut rx, PacketKind::OctreeData).await.unwrap();
        let second = recv_kind(&mut rx, PacketKind::OctreeData).await.unwrap();

        let first_header = PacketHeader::from_bytes(&first.bytes).unwrap();
        let second_header = PacketHeader::from_bytes(&second.bytes).unwrap();
        assert_eq!(first_header.sequence, 0);
        assert_eq!(second_header.sequence, 1);
        assert_eq!(first.dest, addr);

        let first_records =
            ElementRecord::parse_all(&first.bytes[PACKET_HEADER_SIZE..]).unwrap();
        let second_records =
            ElementRecord::parse_all(&second.bytes[PACKET_HEADER_SIZE..]).unwrap();
        assert_eq!(first_records.len(), 3);
        assert_eq!(second_records.len(), 2);
        // 루트가 가장 우선순위가 높아 첫 패킷 첫 레코드다
        assert_eq!(first_records[0].path, Vec::<u8>::new());

        // 다섯 원소가 정확히 한 번씩
        let mut paths: Vec<Vec<u8>> = first_records
            .iter()
            .chain(second_records.iter())
            .map(|record| record.path.clone())
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![vec![], vec![0], vec![1], vec![2], vec![3]]
        );

        // 장면이 끝났고 트리가 안 변했으니 더 오는 데이터는 없다
        assert!(recv_kind(&mut rx, PacketKind::OctreeData).await.is_none());
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_resends_recorded_bytes() {
        let tree = tiny_scene();
        let shared: Arc<RwLock<dyn WorldContent>> = tree.clone();
        let mut config = StreamConfig::default();
        config.max_packet_size = 34;
        config.compress = false;
        let (mut server, mut rx) = Server::start(config, shared);

        let addr: SocketAddr = "127.0.0.1:6002".parse().unwrap();
        server.handle_datagram(addr, query_datagram()).unwrap();
        let first = recv_kind(&mut rx, PacketKind::OctreeData).await.unwrap();
        let _second = recv_kind(&mut rx, PacketKind::OctreeData).await.unwrap();

        // 0번은 이력에 있고 9번은 보낸 적이 없다
        let nack_header = PacketHeader::new(PacketKind::StreamNack, 0, 0);
        let nack = encode_packet(&nack_header, &encode_nack_body(&[0, 9]));
        server.handle_datagram(addr, nack).unwrap();

        let resent = recv_kind(&mut rx, PacketKind::OctreeData).await.unwrap();
        // 기록된 바이트 그대로 재전송된다 (타임스탬프까지 동일)
        assert_eq!(resent.bytes, first.bytes);

        // 9번은 조용히 건너뛴다
        assert!(recv_kind(&mut rx, PacketKind::OctreeData).await.is_none());
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_streams_changed_subtree() {
        let tree = tiny_scene();
        let shared: Arc<RwLock<dyn WorldContent>> = tree.clone();
        let mut config = StreamConfig::default();
        config.compress = false;
        let (mut server, mut rx) = Server::start(config, shared);

        let viewer: SocketAddr = "127.0.0.1:6003".parse().unwrap();
        server.handle_datagram(viewer, query_datagram()).unwrap();
        // 첫 장면을 끝까지 비운다
        while recv_kind(&mut rx, PacketKind::OctreeData).await.is_some() {}

        // 다른 주소에서 편집이 들어온다
        let editor: SocketAddr = "127.0.0.1:6004".parse().unwrap();
        let edit_header = PacketHeader::new(PacketKind::EditSet, 0, 0);
        let edit = encode_packet(&edit_header, &encode_set_record(&[5], [9, 9, 9]));
        server.handle_datagram(editor, edit).unwrap();

        // 편집 워커는 실제 스레드라 실시간으로 기다린다
        for _ in 0..200 {
            if tree.read().voxel_at(&[5]).is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(tree.read().voxel_at(&[5]), Some([9, 9, 9]));

        // 다음 패스가 변경된 가지를 흘려보낸다
        let next = recv_kind(&mut rx, PacketKind::OctreeData).await.unwrap();
        let records = ElementRecord::parse_all(&next.bytes[PACKET_HEADER_SIZE..]).unwrap();
        assert!(records
            .iter()
            .any(|record| record.path == vec![5] && record.color == Some([9, 9, 9])));
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_budget_spaces_packets_across_ticks() {
        let tree = tiny_scene();
        let shared: Arc<RwLock<dyn WorldContent>> = tree.clone();
        let mut config = StreamConfig::default();
        config.max_packet_size = 34;
        config.compress = false;
        // 틱당 1패킷 예산
        config.client_packets_per_second = config.intervals_per_second;
        let interval = config.interval();
        let (mut server, mut rx) = Server::start(config, shared);

        let addr: SocketAddr = "127.0.0.1:6005".parse().unwrap();
        server.handle_datagram(addr, query_datagram()).unwrap();

        let first = recv_kind(&mut rx, PacketKind::OctreeData).await.unwrap();
        let first_at = TokioInstant::now();
        let second = recv_kind(&mut rx, PacketKind::OctreeData).await.unwrap();
        let second_at = TokioInstant::now();

        let first_header = PacketHeader::from_bytes(&first.bytes).unwrap();
        let second_header = PacketHeader::from_bytes(&second.bytes).unwrap();
        assert_eq!(first_header.sequence, 0);
        assert_eq!(second_header.sequence, 1);
        // 예산이 틱당 1이라 두 번째 패킷은 다음 틱에야 나온다
        assert!(second_at.duration_since(first_at) >= interval);
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_change_opens_delta_scene_with_stats() {
        let tree = tiny_scene();
        let shared: Arc<RwLock<dyn WorldContent>> = tree.clone();
        let mut config = StreamConfig::default();
        config.compress = false;
        let (mut server, mut rx) = Server::start(config, shared);

        let addr: SocketAddr = "127.0.0.1:6006".parse().unwrap();
        // 좁은 시야로 첫 장면. 원소들이 시야 경계에 걸친 채 전부 전송된다.
        let mut narrow = viewer_query();
        narrow.fov_deg = 20.0;
        let header = PacketHeader::new(PacketKind::Query, 0, 0);
        server
            .handle_datagram(addr, encode_packet(&header, &narrow.to_bytes()))
            .unwrap();
        while recv_kind(&mut rx, PacketKind::OctreeData).await.is_some() {}

        // 시야가 넓어지면 트리가 안 변했어도 새 장면 세대가 열리고,
        // 직전 장면 통계가 데이터보다 먼저 온다
        let header = PacketHeader::new(PacketKind::Query, 0, 1);
        server
            .handle_datagram(addr, encode_packet(&header, &viewer_query().to_bytes()))
            .unwrap();

        let stats = recv_kind(&mut rx, PacketKind::SceneStats).await.unwrap();
        let message = SceneStatsMessage::from_bytes(&stats.bytes[PACKET_HEADER_SIZE..]).unwrap();
        assert_eq!(message.scene_generation, 1);
        assert!(message.packets >= 1);
        assert_eq!(message.elements_sent, 5);

        // 이전 뷰에 완전히 덮이지 않았던 원소들이 다시 흐른다
        let next = recv_kind(&mut rx, PacketKind::OctreeData).await.unwrap();
        assert!(!ElementRecord::parse_all(&next.bytes[PACKET_HEADER_SIZE..])
            .unwrap()
            .is_empty());
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_erase_flows_to_deletion_list() {
        let tree = tiny_scene();
        let shared: Arc<RwLock<dyn WorldContent>> = tree.clone();
        let mut config = StreamConfig::default();
        config.compress = false;
        let (mut server, mut rx) = Server::start(config, shared);

        let viewer: SocketAddr = "127.0.0.1:6007".parse().unwrap();
        server.handle_datagram(viewer, query_datagram()).unwrap();
        while recv_kind(&mut rx, PacketKind::OctreeData).await.is_some() {}

        let editor: SocketAddr = "127.0.0.1:6008".parse().unwrap();
        let erase_header = PacketHeader::new(PacketKind::EditErase, 0, 0);
        let erase = encode_packet(&erase_header, &encode_erase_record(&[1]));
        server.handle_datagram(editor, erase).unwrap();

        // 편집 워커는 실제 스레드라 실시간으로 기다린다
        for _ in 0..200 {
            if tree.read().voxel_at(&[1]).is_none() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(tree.read().voxel_at(&[1]).is_none());

        // 몇 틱 안에 삭제 목록이 뷰어에게 간다
        let deletion = recv_kind(&mut rx, PacketKind::DeletionList).await.unwrap();
        assert_eq!(deletion.dest, viewer);
        let ids = decode_deletion_body(&deletion.bytes[PACKET_HEADER_SIZE..]).unwrap();
        assert_eq!(ids, vec![pack_path(&[1])]);

        // 워터마크가 전진해 같은 삭제를 다시 보내지 않는다
        assert!(recv_kind(&mut rx, PacketKind::DeletionList).await.is_none());
        server.shutdown().await;
    }
}
