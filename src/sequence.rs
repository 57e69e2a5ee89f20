//! 16비트 순환 시퀀스 번호 연산과 수신 측 누락 추적
//!
//! 시퀀스 번호는 u16으로 순환한다. 크기 비교는 도메인 절반(32768)을
//! 기준으로 래핑을 고려한다.

use std::collections::BTreeSet;

/// 래핑 고려 s1 > s2 판정
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

/// 래핑 고려 s1 < s2 판정
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// a에서 b까지의 래핑 고려 부호 있는 거리
pub fn wrapping_diff(a: u16, b: u16) -> i16 {
    b.wrapping_sub(a) as i16
}

/// 수신 시퀀스 기록 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    /// 기대한 다음 번호
    InOrder,
    /// 건너뜀 발생 (누락 후보 등록)
    Early { skipped: u16 },
    /// 과거 번호 도착, 누락 목록에서 회수
    LateFill,
    /// 이미 받았던 번호
    Duplicate,
    /// 비정상 점프로 추적 리셋
    Reset,
}

/// 송신자별 수신 시퀀스 윈도우
///
/// 누락 집합을 직접 유지한다. 수신 집합의 여집합이므로 의미는 같고
/// 크기는 손실량에만 비례한다.
#[derive(Debug)]
pub struct SequenceWindow {
    /// 마지막으로 수신한 최고 시퀀스
    last_received: Option<u16>,
    /// 아직 도착하지 않은 번호들
    missing: BTreeSet<u16>,
    /// 누락 집합 용량 상한
    capacity: usize,
    /// 이 이상 점프하면 리셋
    max_gap: u16,

    /// 수신 패킷 수
    pub received: u64,
    /// 순서 뒤바뀜 수
    pub out_of_order: u64,
    /// 중복 수신 수
    pub duplicates: u64,
    /// 추적 리셋 수
    pub resets: u64,
}

impl SequenceWindow {
    /// 새 윈도우 생성
    pub fn new(capacity: usize, max_gap: u16) -> Self {
        Self {
            last_received: None,
            missing: BTreeSet::new(),
            capacity,
            max_gap,
            received: 0,
            out_of_order: 0,
            duplicates: 0,
            resets: 0,
        }
    }

    /// 시퀀스 번호 1건 기록
    pub fn record(&mut self, seq: u16) -> SequenceEvent {
        self.received += 1;

        let last = match self.last_received {
            None => {
                self.last_received = Some(seq);
                return SequenceEvent::InOrder;
            }
            Some(last) => last,
        };

        let expected = last.wrapping_add(1);
        if seq == expected {
            self.last_received = Some(seq);
            return SequenceEvent::InOrder;
        }

        if sequence_greater_than(seq, last) {
            let skipped = seq.wrapping_sub(expected);
            if skipped > self.max_gap {
                // 재시작 등 비정상 점프: 누락 집합을 버리고 새로 추적
                self.missing.clear();
                self.last_received = Some(seq);
                self.resets += 1;
                return SequenceEvent::Reset;
            }
            let mut cursor = expected;
            while cursor != seq {
                self.missing.insert(cursor);
                cursor = cursor.wrapping_add(1);
            }
            self.last_received = Some(seq);
            self.trim();
            SequenceEvent::Early { skipped }
        } else {
            self.out_of_order += 1;
            if self.missing.remove(&seq) {
                SequenceEvent::LateFill
            } else {
                self.duplicates += 1;
                SequenceEvent::Duplicate
            }
        }
    }

    /// 현재 누락 번호 목록 (오래된 순)
    pub fn missing(&self) -> Vec<u16> {
        let last = match self.last_received {
            Some(last) => last,
            None => return Vec::new(),
        };
        let mut out: Vec<u16> = self.missing.iter().copied().collect();
        // 래핑 거리 기준 정렬: 최고 수신 번호에서 먼 것이 오래된 것
        out.sort_by_key(|&seq| wrapping_diff(seq, last));
        out.reverse();
        out
    }

    /// 의미 없이 오래된 누락 항목 제거
    pub fn prune(&mut self) {
        let last = match self.last_received {
            Some(last) => last,
            None => return,
        };
        let horizon = self.capacity as i16;
        self.missing
            .retain(|&seq| wrapping_diff(seq, last) <= horizon && wrapping_diff(seq, last) >= 0);
    }

    /// 누락 집합이 용량을 넘지 않게 유지
    fn trim(&mut self) {
        while self.missing.len() > self.capacity {
            let oldest = match self.last_received {
                Some(last) => self
                    .missing
                    .iter()
                    .copied()
                    .max_by_key(|&seq| wrapping_diff(seq, last)),
                None => self.missing.iter().next().copied(),
            };
            match oldest {
                Some(seq) => {
                    self.missing.remove(&seq);
                }
                None => break,
            }
        }
    }

    /// 누락 개수
    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }
}
