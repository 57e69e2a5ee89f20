//! 전송 패킷 히스토리
//!
//! 시퀀스 번호 → 최근 전송 페이로드 링. NACK 재전송에 쓰이고,
//! 용량을 넘으면 가장 오래된 것부터 밀려난다. 밀려난 번호 조회는
//! None이며 에러가 아니다.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

/// 시퀀스 번호별 전송 기록 링
#[derive(Debug)]
pub struct PacketHistory {
    /// 보관 상한
    capacity: usize,

    /// 기록 순서 (밀어내기용)
    order: VecDeque<u16>,

    /// 시퀀스 → 전체 데이터그램 바이트
    entries: HashMap<u16, Bytes>,
}

impl PacketHistory {
    /// 새 히스토리 생성
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// 전송 기록 추가, 용량 초과 시 가장 오래된 항목 제거
    pub fn record(&mut self, sequence: u16, payload: Bytes) {
        if self.entries.insert(sequence, payload).is_none() {
            self.order.push_back(sequence);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    /// 조회: 기록 없음/밀려남이면 None
    pub fn lookup(&self, sequence: u16) -> Option<Bytes> {
        self.entries.get(&sequence).cloned()
    }

    /// 보관 중인 항목 수
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// 비어 있는지
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
