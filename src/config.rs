//! 스트리밍 엔진 설정

use std::time::Duration;

use crate::{INTERVALS_PER_SECOND, MAX_PACKET_SIZE};

/// OVS 스트리밍 설정
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// 데이터그램 최대 크기 (헤더 포함, 바이트)
    pub max_packet_size: usize,

    /// 초당 전송 틱 수
    pub intervals_per_second: u32,

    /// 클라이언트당 초당 패킷 상한
    pub client_packets_per_second: u32,

    /// 서버 전체 초당 패킷 상한
    pub server_packets_per_second: u32,

    /// 섹션 압축 활성화
    pub compress: bool,

    /// zstd 압축 레벨
    pub zstd_level: i32,

    /// 재전송용 패킷 히스토리 용량 (패킷 수)
    pub history_capacity: usize,

    /// 중복 패킷 억제 윈도우 (밀리초)
    pub suppress_window_ms: u64,

    /// 원소 하나당 패킹 재시도 상한
    pub packing_attempts: u32,

    /// 추가 패킹을 시도할 최소 잔여 공간 (바이트)
    pub min_packing_room: usize,

    /// 압축 크기 오차 대비 예약 공간 (바이트)
    pub compress_padding: usize,

    /// 틱당 트리 순회 시간 예산 (마이크로초)
    pub traversal_budget_us: u64,

    /// 뷰 동일 판정 위치 오차 (월드 단위)
    pub view_position_epsilon: f32,

    /// 뷰 동일 판정 각도 오차 (도)
    pub view_angle_epsilon_deg: f32,

    /// 삭제 목록 등 부가 데이터 전송 주기 (틱 수)
    pub extra_data_ticks: u32,

    /// 수신 시퀀스 누락 스캔 주기 (밀리초)
    pub nack_scan_interval_ms: u64,

    /// 시퀀스 점프 허용 상한 (초과 시 추적 리셋)
    pub max_reasonable_gap: u16,

    /// 송신자별 수신 시퀀스 윈도우 용량
    pub sequence_window_capacity: usize,

    /// 삭제 로그 보존 기간 (밀리초)
    pub deletion_horizon_ms: u64,

    /// 인바운드 편집 워커 수
    pub inbound_workers: usize,

    /// 송신 큐 용량 (데이터그램 수)
    pub send_queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            intervals_per_second: INTERVALS_PER_SECOND,
            client_packets_per_second: 600,   // 틱당 10개
            server_packets_per_second: 6000,
            compress: true,
            zstd_level: 3,
            history_capacity: 512,
            suppress_window_ms: 1000,         // 1초
            packing_attempts: 5,
            min_packing_room: 42,             // 섹션 프리픽스 + 40
            compress_padding: 15,
            traversal_budget_us: 100,
            view_position_epsilon: 0.1,
            view_angle_epsilon_deg: 1.0,
            extra_data_ticks: 8,
            nack_scan_interval_ms: 1000,
            max_reasonable_gap: 1000,
            sequence_window_capacity: 4096,
            deletion_horizon_ms: 60_000,      // 60초
            inbound_workers: 2,
            send_queue_capacity: 1024,
        }
    }
}

impl StreamConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 틱 간격
    pub fn interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.intervals_per_second.max(1) as u64)
    }

    /// 클라이언트당 틱별 패킷 예산
    pub fn client_packets_per_interval(&self) -> u32 {
        (self.client_packets_per_second / self.intervals_per_second.max(1)).max(1)
    }

    /// 서버 전체 틱별 패킷 예산
    pub fn server_packets_per_interval(&self) -> u32 {
        (self.server_packets_per_second / self.intervals_per_second.max(1)).max(1)
    }

    /// 클라이언트가 요청한 전송률을 서버 상한으로 제한
    pub fn clamp_client_rate(&self, requested_pps: u32) -> u32 {
        if requested_pps == 0 {
            self.client_packets_per_second
        } else {
            requested_pps.min(self.client_packets_per_second)
        }
    }

    /// 헤더 제외 페이로드 예산
    pub fn payload_budget(&self) -> usize {
        self.max_packet_size.saturating_sub(crate::wire::PACKET_HEADER_SIZE)
    }

    /// LAN용 설정: 압축 없이 고속 전송
    pub fn lan() -> Self {
        Self {
            compress: false,
            client_packets_per_second: 1800,  // 틱당 30개
            server_packets_per_second: 30000,
            suppress_window_ms: 500,
            nack_scan_interval_ms: 250,
            ..Self::default()
        }
    }

    /// WAN용 설정: 압축 + 보수적 전송률
    pub fn wan() -> Self {
        Self {
            compress: true,
            zstd_level: 6,
            client_packets_per_second: 300,   // 틱당 5개
            server_packets_per_second: 3000,
            history_capacity: 1024,
            ..Self::default()
        }
    }

    /// 손실 많은 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            compress: true,
            max_packet_size: 1200,            // 작은 데이터그램
            client_packets_per_second: 300,
            server_packets_per_second: 3000,
            history_capacity: 2048,           // 긴 재전송 기억
            suppress_window_ms: 2000,
            nack_scan_interval_ms: 500,       // 잦은 누락 스캔
            extra_data_ticks: 4,
            ..Self::default()
        }
    }
}
