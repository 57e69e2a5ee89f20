//! 공유 트리 경계 인터페이스
//!
//! 엔진은 구체 트리 타입을 모른다. 원소 구조 접근은 TreeElement로,
//! 편집 라우팅과 적용은 WorldContent로 추상화된다. 순회 커서는 원소
//! 참조 대신 옥탄트 경로를 들고 매 스텝 루트에서 다시 내려간다.

use crate::buffer::PacketBuffer;
use crate::error::Result;
use crate::frustum::Cube;
use crate::wire::PacketKind;

/// 원소 식별자 (옥탄트 경로 팩킹)
pub type ElementId = u64;

/// 경로 최대 깊이 (팩킹 한계)
pub const MAX_PATH_DEPTH: usize = 15;

/// 옥탄트 경로를 u64 식별자로 팩킹
///
/// 상위 4비트 = 깊이, 이후 3비트씩 루트부터의 옥탄트.
pub fn pack_path(path: &[u8]) -> ElementId {
    debug_assert!(path.len() <= MAX_PATH_DEPTH);
    let mut id = (path.len() as u64) << 60;
    for (level, &octant) in path.iter().enumerate() {
        id |= ((octant & 0x7) as u64) << (57 - level * 3);
    }
    id
}

/// 식별자에서 옥탄트 경로 복원
pub fn unpack_path(id: ElementId) -> Vec<u8> {
    let depth = ((id >> 60) & 0xF) as usize;
    (0..depth)
        .map(|level| ((id >> (57 - level * 3)) & 0x7) as u8)
        .collect()
}

/// 인코딩 상세 수준
///
/// 재시도마다 한 단계씩 낮춘다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeDetail {
    /// 색상 포함 풀 디테일
    Full,
    /// 선택 필드 생략, 구조만
    Minimal,
}

/// 원소 인코딩 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// 버퍼에 기록 완료
    Appended,
    /// 현재 버퍼 예산에 안 들어감
    DidntFit,
}

/// 트리 원소 (락 아래에서 빌림으로만 접근)
pub trait TreeElement {
    /// 옥탄트 자식
    fn child(&self, octant: u8) -> Option<&dyn TreeElement>;

    /// 잎 데이터 보유 여부
    fn has_payload(&self) -> bool;

    /// 이 원소의 변경 시각 (마이크로초)
    fn changed_at_us(&self) -> u64;

    /// 서브트리에서 가장 최근 변경 시각
    fn subtree_changed_at_us(&self) -> u64;

    /// 자식 존재 비트마스크
    fn child_mask(&self) -> u8 {
        let mut mask = 0u8;
        for octant in 0..8 {
            if self.child(octant).is_some() {
                mask |= 1 << octant;
            }
        }
        mask
    }

    /// 원소 내용을 버퍼에 기록
    fn encode_payload(
        &self,
        path: &[u8],
        buffer: &mut PacketBuffer,
        detail: EncodeDetail,
    ) -> EncodeOutcome;
}

/// 편집 적용 결과
#[derive(Debug, Clone, Copy)]
pub struct EditApplied {
    /// 레코드가 소비한 바이트 수
    pub consumed: usize,

    /// 삭제가 일어났으면 삭제된 원소 식별자
    pub deleted_id: Option<ElementId>,
}

/// 스트리밍 가능한 컨텐츠 트리의 능력 집합
pub trait WorldContent: Send + Sync + 'static {
    /// 루트 원소
    fn root(&self) -> &dyn TreeElement;

    /// 루트 셀
    fn root_cube(&self) -> Cube;

    /// 이 컨텐츠가 처리하는 편집 패킷 타입인지
    fn handles_edit(&self, kind: PacketKind) -> bool;

    /// 편집 레코드 1건 적용, 소비 바이트와 삭제 정보를 반환
    fn apply_edit(&mut self, kind: PacketKind, record: &[u8], timestamp_us: u64)
        -> Result<EditApplied>;
}

/// 경로를 따라 내려가 원소를 찾는다
pub fn descend<'a>(root: &'a dyn TreeElement, path: &[u8]) -> Option<&'a dyn TreeElement> {
    let mut element = root;
    for &octant in path {
        element = element.child(octant)?;
    }
    Some(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_packing_roundtrip() {
        for path in [
            vec![],
            vec![0u8],
            vec![7, 0, 3],
            vec![1, 2, 3, 4, 5, 6, 7, 0, 1, 2, 3, 4, 5, 6, 7],
        ] {
            assert_eq!(unpack_path(pack_path(&path)), path);
        }
    }

    #[test]
    fn test_path_packing_distinct() {
        // 같은 옥탄트라도 깊이가 다르면 다른 식별자
        assert_ne!(pack_path(&[0]), pack_path(&[0, 0]));
        assert_ne!(pack_path(&[1, 2]), pack_path(&[2, 1]));
    }
}
