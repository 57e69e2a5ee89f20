//! 스트림 통계
//!
//! 세션별 송신 통계, 발신자별 수신 통계, 서버 전역 카운터.
//! 장면 인코딩 통계는 장면 완료 시 통계 패킷으로 클라이언트에도 전달된다.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::sequence::SequenceWindow;
use crate::wire::SceneStatsMessage;

/// 이동 평균 샘플 수
const SAMPLE_WINDOW: usize = 10;

/// 장면 인코딩 통계 (장면 세대별로 리셋)
#[derive(Debug, Clone, Copy, Default)]
pub struct SceneStats {
    /// 장면 세대 번호
    pub scene_generation: u64,

    /// 순회가 방문한 원소 수
    pub elements_visited: u64,

    /// 실제 패킷에 실린 원소 수
    pub elements_sent: u64,

    /// 송신한 옥트리 패킷 수
    pub packets: u64,

    /// 송신한 옥트리 페이로드 바이트
    pub bytes: u64,

    /// 순회 + 인코딩에 쓴 시간 (마이크로초)
    pub encode_us: u64,
}

impl SceneStats {
    /// 새 장면 세대 시작
    pub fn begin(scene_generation: u64) -> Self {
        Self {
            scene_generation,
            ..Default::default()
        }
    }

    /// 통계 패킷용 메시지로 변환
    pub fn to_message(&self) -> SceneStatsMessage {
        SceneStatsMessage {
            scene_generation: self.scene_generation,
            elements_visited: self.elements_visited,
            elements_sent: self.elements_sent,
            packets: self.packets,
            bytes: self.bytes,
            encode_us: self.encode_us,
        }
    }
}

/// 송신 기록
#[derive(Debug, Clone, Copy)]
struct SendRecord {
    timestamp: Instant,
    size: usize,
}

/// 세션 송신 통계
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// 세션 시작 시간
    pub start_time: Instant,

    /// 송신 패킷 수
    pub packets_sent: u64,

    /// 송신 바이트
    pub bytes_sent: u64,

    /// 송신한 원소 수
    pub elements_sent: u64,

    /// NACK 재전송 패킷 수
    pub resent_packets: u64,

    /// 수신한 NACK 패킷 수
    pub nacks_received: u64,

    /// 중복 억제로 생략한 패킷 수
    pub suppressed_duplicates: u64,

    /// 송신 큐 포화로 버린 패킷 수
    pub dropped_sends: u64,

    /// 완료한 패스 수
    pub passes_completed: u64,

    /// 최근 송신 기록
    sends: VecDeque<SendRecord>,

    /// 윈도우 크기
    window_size: usize,
}

impl SessionStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            start_time: Instant::now(),
            packets_sent: 0,
            bytes_sent: 0,
            elements_sent: 0,
            resent_packets: 0,
            nacks_received: 0,
            suppressed_duplicates: 0,
            dropped_sends: 0,
            passes_completed: 0,
            sends: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// 송신 기록
    pub fn record_send(&mut self, size: usize) {
        if self.sends.len() >= self.window_size {
            self.sends.pop_front();
        }
        self.sends.push_back(SendRecord {
            timestamp: Instant::now(),
            size,
        });
        self.packets_sent += 1;
        self.bytes_sent += size as u64;
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 최근 송신률 (packets/sec)
    pub fn send_rate(&self) -> f64 {
        if self.sends.len() < 2 {
            return 0.0;
        }

        let first = self.sends.front().unwrap().timestamp;
        let last = self.sends.back().unwrap().timestamp;
        let duration = last.duration_since(first);

        if duration.is_zero() {
            return 0.0;
        }

        (self.sends.len() - 1) as f64 / duration.as_secs_f64()
    }

    /// 최근 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        if self.sends.len() < 2 {
            return 0.0;
        }

        let first = self.sends.front().unwrap().timestamp;
        let last = self.sends.back().unwrap().timestamp;
        let duration = last.duration_since(first);

        if duration.is_zero() {
            return 0.0;
        }

        let total_size: usize = self.sends.iter().map(|s| s.size).sum();
        total_size as f64 / duration.as_secs_f64()
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Packets: {} | Bytes: {} | Elements: {} | Resent: {} | Suppressed: {} | Passes: {}",
            self.elapsed().as_secs_f64(),
            self.packets_sent,
            self.bytes_sent,
            self.elements_sent,
            self.resent_packets,
            self.suppressed_duplicates,
            self.passes_completed,
        )
    }
}

/// 발신자별 수신 통계 (편집 인제스트 측)
#[derive(Debug)]
pub struct SenderStats {
    /// 시퀀스 추적 윈도우
    pub sequences: SequenceWindow,

    /// 수신 패킷 수
    pub packets_received: u64,

    /// 수신 바이트
    pub bytes_received: u64,

    /// 적용된 편집 레코드 수
    pub edits_applied: u64,

    /// 실패한 편집 레코드 수
    pub edits_failed: u64,

    /// 도착 시각으로 보정한 송신 타임스탬프 수
    pub clock_skews: u64,

    /// 이 발신자에게 보낸 NACK 패킷 수
    pub nacks_sent: u64,

    /// 전송 지연 샘플 (마이크로초)
    transit_samples: VecDeque<u64>,

    /// 처리 시간 샘플 (마이크로초)
    process_samples: VecDeque<u64>,

    /// 락 대기 샘플 (마이크로초)
    lock_samples: VecDeque<u64>,

    /// 마지막 수신 시간
    pub last_seen: Instant,
}

impl SenderStats {
    pub fn new(window_capacity: usize, max_gap: u16) -> Self {
        Self {
            sequences: SequenceWindow::new(window_capacity, max_gap),
            packets_received: 0,
            bytes_received: 0,
            edits_applied: 0,
            edits_failed: 0,
            clock_skews: 0,
            nacks_sent: 0,
            transit_samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            process_samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            lock_samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            last_seen: Instant::now(),
        }
    }

    /// 패킷 수신 기록
    pub fn record_packet(&mut self, size: usize, transit_us: u64) {
        self.packets_received += 1;
        self.bytes_received += size as u64;
        push_sample(&mut self.transit_samples, transit_us);
        self.last_seen = Instant::now();
    }

    /// 처리 완료 기록
    pub fn record_process(&mut self, process_us: u64, lock_wait_us: u64) {
        push_sample(&mut self.process_samples, process_us);
        push_sample(&mut self.lock_samples, lock_wait_us);
    }

    /// 평균 전송 지연 (마이크로초)
    pub fn average_transit_us(&self) -> Option<u64> {
        average(&self.transit_samples)
    }

    /// 평균 처리 시간 (마이크로초)
    pub fn average_process_us(&self) -> Option<u64> {
        average(&self.process_samples)
    }

    /// 평균 락 대기 (마이크로초)
    pub fn average_lock_wait_us(&self) -> Option<u64> {
        average(&self.lock_samples)
    }

    /// 일정 시간 수신이 없었는지
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() >= timeout
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Recv: {} | Edits: {}/{} | OutOfOrder: {} | Dup: {} | Missing: {} | Transit: {}us | Process: {}us",
            self.packets_received,
            self.edits_applied,
            self.edits_applied + self.edits_failed,
            self.sequences.out_of_order,
            self.sequences.duplicates,
            self.sequences.missing_count(),
            self.average_transit_us().unwrap_or(0),
            self.average_process_us().unwrap_or(0),
        )
    }
}

fn push_sample(samples: &mut VecDeque<u64>, value: u64) {
    if samples.len() >= SAMPLE_WINDOW {
        samples.pop_front();
    }
    samples.push_back(value);
}

fn average(samples: &VecDeque<u64>) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<u64>() / samples.len() as u64)
}

/// 서버 전역 카운터
#[derive(Debug, Default)]
pub struct ServerCounters {
    /// 수신 패킷 수
    pub packets_in: AtomicU64,

    /// 수신 바이트
    pub bytes_in: AtomicU64,

    /// 송신 패킷 수
    pub packets_out: AtomicU64,

    /// 송신 바이트
    pub bytes_out: AtomicU64,

    /// 적용된 편집 수
    pub edits_applied: AtomicU64,

    /// 실패한 편집 수
    pub edits_failed: AtomicU64,

    /// 수신 NACK 패킷 수
    pub nacks_in: AtomicU64,

    /// 송신 NACK 패킷 수
    pub nacks_out: AtomicU64,

    /// 재전송 패킷 수
    pub resent_packets: AtomicU64,

    /// 중복 억제 수
    pub suppressed_duplicates: AtomicU64,

    /// 송신 원소 수
    pub elements_sent: AtomicU64,
}

/// 카운터 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
    pub edits_applied: u64,
    pub edits_failed: u64,
    pub nacks_in: u64,
    pub nacks_out: u64,
    pub resent_packets: u64,
    pub suppressed_duplicates: u64,
    pub elements_sent: u64,
}

impl ServerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// 카운터 증가
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// 현재 값 스냅샷
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            edits_applied: self.edits_applied.load(Ordering::Relaxed),
            edits_failed: self.edits_failed.load(Ordering::Relaxed),
            nacks_in: self.nacks_in.load(Ordering::Relaxed),
            nacks_out: self.nacks_out.load(Ordering::Relaxed),
            resent_packets: self.resent_packets.load(Ordering::Relaxed),
            suppressed_duplicates: self.suppressed_duplicates.load(Ordering::Relaxed),
            elements_sent: self.elements_sent.load(Ordering::Relaxed),
        }
    }

    /// 통계 요약 문자열
    pub fn summary(&self, active_sessions: usize) -> String {
        let snap = self.snapshot();
        format!(
            "Sessions: {} | In: {} pkt / {} B | Out: {} pkt / {} B | Edits: {} | Resent: {} | Suppressed: {} | NACKs: {}/{}",
            active_sessions,
            snap.packets_in,
            snap.bytes_in,
            snap.packets_out,
            snap.bytes_out,
            snap.edits_applied,
            snap.resent_packets,
            snap.suppressed_duplicates,
            snap.nacks_in,
            snap.nacks_out,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_stats_to_message() {
        let mut stats = SceneStats::begin(3);
        stats.elements_visited = 100;
        stats.elements_sent = 80;
        stats.packets = 5;
        stats.bytes = 6000;
        stats.encode_us = 450;

        let msg = stats.to_message();
        assert_eq!(msg.scene_generation, 3);
        assert_eq!(msg.elements_visited, 100);
        assert_eq!(msg.elements_sent, 80);
        assert_eq!(msg.packets, 5);
    }

    #[test]
    fn test_session_send_window() {
        let mut stats = SessionStats::new(4);
        for _ in 0..10 {
            stats.record_send(1000);
        }
        assert_eq!(stats.packets_sent, 10);
        assert_eq!(stats.bytes_sent, 10_000);
        // 윈도우는 최근 4건만 유지
        assert_eq!(stats.sends.len(), 4);
    }

    #[test]
    fn test_sender_sample_averages() {
        let mut stats = SenderStats::new(64, 100);
        assert_eq!(stats.average_transit_us(), None);

        for i in 0..20u64 {
            stats.record_packet(100, i * 100);
        }
        // 최근 10개 샘플 평균: (1000 + ... + 1900) / 10
        assert_eq!(stats.average_transit_us(), Some(1450));

        stats.record_process(300, 50);
        stats.record_process(500, 150);
        assert_eq!(stats.average_process_us(), Some(400));
        assert_eq!(stats.average_lock_wait_us(), Some(100));
    }

    #[test]
    fn test_sender_sequence_integration() {
        let mut stats = SenderStats::new(64, 100);
        for seq in [0u16, 1, 3, 3] {
            stats.sequences.record(seq);
        }
        assert_eq!(stats.sequences.duplicates, 1);
        assert_eq!(stats.sequences.missing_count(), 1);
        assert!(stats.summary().contains("Missing: 1"));
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = ServerCounters::new();
        ServerCounters::add(&counters.packets_in, 5);
        ServerCounters::add(&counters.bytes_in, 700);
        ServerCounters::add(&counters.edits_applied, 3);

        let snap = counters.snapshot();
        assert_eq!(snap.packets_in, 5);
        assert_eq!(snap.bytes_in, 700);
        assert_eq!(snap.edits_applied, 3);
        assert_eq!(snap.packets_out, 0);
    }
}
