//! 클라이언트 세션
//!
//! 클라이언트 하나의 스트림 상태 전부: 뷰, 진행 중 패스, 우선순위 큐,
//! 조립 중 패킷, 송신 이력, 중복 억제, NACK 재전송 대기열.
//! 세션은 배포 태스크 하나가 소유하며 락 없이 단일 소유로 변경한다.

use std::collections::{BinaryHeap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::config::StreamConfig;
use crate::frustum::{Cube, DetailParams, ViewFrustum};
use crate::history::PacketHistory;
use crate::stats::{SceneStats, SessionStats};
use crate::traversal::{CompletedPass, PrioritizedElement, Traversal, TraversalMode};
use crate::wire::{
    PacketHeader, PacketKind, QueryMessage, FLAG_COLOR, FLAG_COMPRESSED, PACKET_HEADER_SIZE,
    SECTION_PREFIX_SIZE,
};

/// 조립 중인 송신 데이터그램
///
/// 헤더 뒤에 섹션들을 이어 붙인다. 압축 모드에서는 섹션마다 u16 LE
/// 길이 접두사를 붙이고, 비압축 모드에서는 접두사 없이 그대로 잇는다.
/// 헤더는 실제 송신 시점의 finish에서 새 타임스탬프로 쓴다.
#[derive(Debug)]
pub struct PendingPacket {
    payload: BytesMut,
    sections: u16,
    target_size: usize,
    compressed: bool,
    color: bool,
}

impl PendingPacket {
    pub fn new(target_size: usize, compressed: bool, color: bool) -> Self {
        Self {
            payload: BytesMut::with_capacity(target_size),
            sections: 0,
            target_size,
            compressed,
            color,
        }
    }

    /// 이 크기의 섹션이 들어갈 수 있는지
    pub fn has_room(&self, section_len: usize) -> bool {
        let framing = if self.compressed { SECTION_PREFIX_SIZE } else { 0 };
        PACKET_HEADER_SIZE + self.payload.len() + framing + section_len <= self.target_size
    }

    /// 섹션 추가. 공간이 없으면 false.
    pub fn append_section(&mut self, section: &[u8]) -> bool {
        if section.is_empty() || !self.has_room(section.len()) {
            return false;
        }
        if self.compressed {
            if section.len() > u16::MAX as usize {
                return false;
            }
            self.payload.put_u16_le(section.len() as u16);
        }
        self.payload.extend_from_slice(section);
        self.sections += 1;
        true
    }

    /// 헤더 제외 페이로드 (중복 비교용)
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// 남은 공간 (헤더 포함 기준)
    pub fn remaining(&self) -> usize {
        self.target_size
            .saturating_sub(PACKET_HEADER_SIZE + self.payload.len())
    }

    pub fn section_count(&self) -> u16 {
        self.sections
    }

    pub fn is_empty(&self) -> bool {
        self.sections == 0
    }

    /// 스테이징 비우기 (억제된 패킷 폐기)
    pub fn clear(&mut self) {
        self.payload.clear();
        self.sections = 0;
    }

    /// 헤더를 붙여 데이터그램 완성. 조립 상태는 초기화된다.
    pub fn finish(&mut self, kind: PacketKind, sequence: u16) -> Bytes {
        let mut flags = 0u8;
        if self.color {
            flags |= FLAG_COLOR;
        }
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        let header = PacketHeader::new(kind, flags, sequence);

        let mut out = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&self.payload);
        self.clear();
        out.freeze()
    }
}

/// 클라이언트 스트림 세션
pub struct ClientSession {
    /// 클라이언트 주소
    pub addr: SocketAddr,

    /// 서버가 부여한 세션 번호
    pub client_id: u64,

    // 뷰 상태
    current_view: Option<ViewFrustum>,
    pending_view: Option<ViewFrustum>,
    detail: DetailParams,
    max_packets_per_interval: u32,

    /// 진행 중 패스 (소진 후에도 complete_pass 전까지 유지)
    pub traversal: Option<Traversal>,
    pass_view: Option<ViewFrustum>,
    pass_started_at_us: u64,
    completed: Option<CompletedPass>,
    /// 뷰가 크게 바뀌어 트리 변경과 무관하게 새 패스가 필요함
    view_dirty: bool,

    /// 장면 세대 (전체/델타 패스 시작마다 증가)
    pub scene_generation: u64,

    /// 현재 장면 인코딩 통계
    pub scene_stats: SceneStats,

    // 송신 상태
    sequence: u16,
    pub pending: PendingPacket,
    pub queue: BinaryHeap<PrioritizedElement>,
    pub history: PacketHistory,
    nack_queue: VecDeque<u16>,

    // 중복 억제
    last_payload: Option<Bytes>,
    last_payload_at: Option<Instant>,

    /// 억제된 중복 패킷 수
    pub duplicate_count: u64,

    /// 삭제 로그 워터마크 (이 시각 이후 삭제만 미송신)
    pub deletion_watermark_us: u64,

    /// 세션 통계
    pub stats: SessionStats,
}

impl ClientSession {
    pub fn new(addr: SocketAddr, client_id: u64, config: &StreamConfig) -> Self {
        Self {
            addr,
            client_id,
            current_view: None,
            pending_view: None,
            detail: DetailParams::default(),
            max_packets_per_interval: config.client_packets_per_interval(),
            traversal: None,
            pass_view: None,
            pass_started_at_us: 0,
            completed: None,
            view_dirty: false,
            scene_generation: 0,
            scene_stats: SceneStats::default(),
            sequence: 0,
            pending: PendingPacket::new(config.max_packet_size, config.compress, true),
            queue: BinaryHeap::new(),
            history: PacketHistory::new(config.history_capacity),
            nack_queue: VecDeque::new(),
            last_payload: None,
            last_payload_at: None,
            duplicate_count: 0,
            deletion_watermark_us: 0,
            stats: SessionStats::new(64),
        }
    }

    /// 질의 반영: 뷰는 틱 경계에서 집어가고, LOD와 송신률은 즉시 갱신
    pub fn apply_query(&mut self, query: &QueryMessage, config: &StreamConfig) {
        self.pending_view = Some(ViewFrustum::from_query(query));
        if query.size_scale > 0.0 {
            self.detail.size_scale = query.size_scale;
        }
        self.detail.boundary_level_adjust = query.boundary_level_adjust;
        let pps = config.clamp_client_rate(query.max_packets_per_second);
        self.max_packets_per_interval = (pps / config.intervals_per_second.max(1)).max(1);
    }

    /// 틱 경계에서 새 뷰 집어가기
    pub fn take_pending_view(&mut self) -> Option<ViewFrustum> {
        self.pending_view.take()
    }

    pub fn current_view(&self) -> Option<&ViewFrustum> {
        self.current_view.as_ref()
    }

    pub fn set_current_view(&mut self, view: ViewFrustum) {
        self.current_view = Some(view);
    }

    pub fn detail(&self) -> DetailParams {
        self.detail
    }

    /// 틱당 송신 한도
    pub fn packets_per_interval(&self) -> u32 {
        self.max_packets_per_interval
    }

    /// 순회가 아직 원소를 내놓는 중인지
    pub fn has_active_pass(&self) -> bool {
        self.traversal.as_ref().map(|t| t.is_active()).unwrap_or(false)
    }

    /// 새 패스가 필요한지: 패스가 없고, 뷰가 바뀌었거나 아직 완료한
    /// 패스가 없거나 직전 패스 시작 이후 트리가 변했을 때
    pub fn needs_pass(&self, root_changed_us: u64) -> bool {
        if self.current_view.is_none() || self.traversal.is_some() {
            return false;
        }
        if self.view_dirty {
            return true;
        }
        match &self.completed {
            None => true,
            Some(pass) => root_changed_us >= pass.at_us,
        }
    }

    /// 현재 뷰로 새 패스 시작. 전체/델타 패스면 장면 세대를 올린다.
    pub fn begin_pass(
        &mut self,
        root_cube: Cube,
        now_us: u64,
        config: &StreamConfig,
    ) -> Option<TraversalMode> {
        let view = self.current_view?;
        let traversal = Traversal::start(
            view,
            self.detail,
            root_cube,
            self.completed,
            config.view_position_epsilon,
            config.view_angle_epsilon_deg,
        );
        let mode = traversal.mode()?;
        if mode != TraversalMode::Continuation {
            self.scene_generation += 1;
            self.scene_stats = SceneStats::begin(self.scene_generation);
            self.queue.clear();
        }
        self.pass_view = Some(view);
        self.pass_started_at_us = now_us;
        self.traversal = Some(traversal);
        self.view_dirty = false;
        debug!(client_id = self.client_id, ?mode, "새 패스 시작");
        Some(mode)
    }

    /// 패스 완료 처리. 다음 패스의 기준 시점은 이번 패스 시작 시각이라
    /// 패스 도중 들어온 변경도 다음 패스가 잡는다.
    pub fn complete_pass(&mut self) {
        if let Some(view) = self.pass_view.take() {
            self.completed = Some(CompletedPass {
                view,
                at_us: self.pass_started_at_us,
            });
        }
        self.traversal = None;
        self.stats.passes_completed += 1;
    }

    /// 진행 중 패스 폐기 (뷰가 크게 바뀌었을 때)
    ///
    /// 트리가 그대로여도 다음 틱에 새 패스가 열리도록 표시한다.
    pub fn abandon_pass(&mut self) {
        self.traversal = None;
        self.pass_view = None;
        self.view_dirty = true;
    }

    /// 다음 송신 시퀀스 번호
    pub fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    /// NACK 수신: 재전송 대기열에 넣는다
    pub fn on_nack(&mut self, sequences: &[u16]) {
        self.stats.nacks_received += 1;
        for &seq in sequences {
            if !self.nack_queue.contains(&seq) {
                self.nack_queue.push_back(seq);
            }
        }
    }

    /// 재전송할 다음 패킷. 이력에서 밀려난 번호는 건너뛴다.
    pub fn next_resend(&mut self) -> Option<(u16, Bytes)> {
        while let Some(seq) = self.nack_queue.pop_front() {
            match self.history.lookup(seq) {
                Some(bytes) => return Some((seq, bytes)),
                None => {
                    debug!(
                        client_id = self.client_id,
                        sequence = seq,
                        "이력에 없는 NACK 번호, 건너뜀"
                    );
                }
            }
        }
        None
    }

    pub fn pending_resends(&self) -> usize {
        self.nack_queue.len()
    }

    /// 직전 송신과 같은 페이로드인지 (억제 윈도우 안)
    pub fn is_duplicate_within(&self, payload: &[u8], window: Duration) -> bool {
        let last = match &self.last_payload {
            Some(last) => last,
            None => return false,
        };
        if last.as_ref() != payload {
            return false;
        }
        match self.last_payload_at {
            Some(at) => at.elapsed() < window,
            None => false,
        }
    }

    /// 실제 송신한 페이로드 기록 (억제 윈도우 기준점)
    pub fn note_payload_sent(&mut self, payload: Bytes) {
        self.last_payload = Some(payload);
        self.last_payload_at = Some(Instant::now());
    }
}
