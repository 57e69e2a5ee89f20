//! 기준 복셀 컨텐츠
//!
//! 엔진 경계 트레이트를 구현하는 컴팩트한 복셀 옥트리. 데모 바이너리와
//! 종단 테스트가 쓴다. 원소 레코드와 편집 레코드는 자기 길이를 스스로
//! 기술하므로 페이로드가 끝날 때까지 순서대로 읽을 수 있다.
//!
//! 원소 레코드: 깊이(1) + 3비트 팩킹 옥탄트 + 자식 마스크(1)
//! + 색상 플래그(1) + [색상 3]. 편집 레코드: 깊이(1) + 팩킹 옥탄트
//! + [색상 3 (설정일 때)].

use glam::Vec3;

use crate::buffer::PacketBuffer;
use crate::error::{Error, Result};
use crate::frustum::Cube;
use crate::tree::{
    pack_path, EditApplied, EncodeDetail, EncodeOutcome, TreeElement, WorldContent,
    MAX_PATH_DEPTH,
};
use crate::wire::PacketKind;

/// 옥탄트 경로를 3비트씩 팩킹 (MSB 우선)
pub fn pack_octants(path: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; (path.len() * 3 + 7) / 8];
    for (level, &octant) in path.iter().enumerate() {
        let bit = level * 3;
        for offset in 0..3 {
            if octant & (0x4 >> offset) != 0 {
                out[(bit + offset) / 8] |= 0x80 >> ((bit + offset) % 8);
            }
        }
    }
    out
}

/// 팩킹된 옥탄트 복원
pub fn unpack_octants(depth: usize, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(depth);
    for level in 0..depth {
        let bit = level * 3;
        let mut octant = 0u8;
        for offset in 0..3 {
            let index = (bit + offset) / 8;
            if index < bytes.len() && bytes[index] & (0x80 >> ((bit + offset) % 8)) != 0 {
                octant |= 0x4 >> offset;
            }
        }
        out.push(octant);
    }
    out
}

/// 팩킹된 경로의 바이트 수
fn packed_len(depth: usize) -> usize {
    (depth * 3 + 7) / 8
}

/// 복셀 노드
#[derive(Debug, Default)]
pub struct VoxelNode {
    children: [Option<Box<VoxelNode>>; 8],
    color: Option<[u8; 3]>,
    changed_at_us: u64,
    subtree_changed_at_us: u64,
}

impl VoxelNode {
    fn touch(&mut self, timestamp_us: u64) {
        if timestamp_us > self.changed_at_us {
            self.changed_at_us = timestamp_us;
        }
        if timestamp_us > self.subtree_changed_at_us {
            self.subtree_changed_at_us = timestamp_us;
        }
    }

    /// 색상
    pub fn color(&self) -> Option<[u8; 3]> {
        self.color
    }
}

impl TreeElement for VoxelNode {
    fn child(&self, octant: u8) -> Option<&dyn TreeElement> {
        self.children
            .get(octant as usize)
            .and_then(|slot| slot.as_deref())
            .map(|node| node as &dyn TreeElement)
    }

    fn has_payload(&self) -> bool {
        self.color.is_some()
    }

    fn changed_at_us(&self) -> u64 {
        self.changed_at_us
    }

    fn subtree_changed_at_us(&self) -> u64 {
        self.subtree_changed_at_us
    }

    fn encode_payload(
        &self,
        path: &[u8],
        buffer: &mut PacketBuffer,
        detail: EncodeDetail,
    ) -> EncodeOutcome {
        let mut structure = Vec::with_capacity(2 + packed_len(path.len()));
        structure.push(path.len() as u8);
        structure.extend_from_slice(&pack_octants(path));
        structure.push(self.child_mask());
        if !buffer.append(&structure) {
            return EncodeOutcome::DidntFit;
        }

        // 색상은 선택 필드: 안 들어가면 레벨 키로 되감고 최소 표현으로
        if detail == EncodeDetail::Full {
            if let Some([r, g, b]) = self.color {
                let key = buffer.begin_level();
                if buffer.append(&[1, r, g, b]) {
                    buffer.end_level(key);
                    return EncodeOutcome::Appended;
                }
                buffer.discard_level(key);
            }
        }
        if !buffer.append(&[0]) {
            return EncodeOutcome::DidntFit;
        }
        EncodeOutcome::Appended
    }
}

/// 복셀 옥트리
pub struct VoxelTree {
    root: VoxelNode,
    root_cube: Cube,
}

impl VoxelTree {
    /// 새 트리 생성
    pub fn new(root_cube: Cube) -> Self {
        Self {
            root: VoxelNode::default(),
            root_cube,
        }
    }

    /// 기본 크기 트리 (원점 기준 한 변 256)
    pub fn with_default_bounds() -> Self {
        Self::new(Cube::new(Vec3::splat(-128.0), 256.0))
    }

    /// 경로 위치에 복셀 설정 (중간 노드 자동 생성)
    pub fn set_voxel(&mut self, path: &[u8], color: [u8; 3], timestamp_us: u64) -> Result<()> {
        if path.len() > MAX_PATH_DEPTH {
            return Err(Error::PathTooDeep {
                depth: path.len(),
                max: MAX_PATH_DEPTH,
            });
        }
        Self::set_inner(&mut self.root, path, color, timestamp_us);
        Ok(())
    }

    fn set_inner(node: &mut VoxelNode, path: &[u8], color: [u8; 3], timestamp_us: u64) {
        match path.split_first() {
            None => {
                node.color = Some(color);
                node.touch(timestamp_us);
            }
            Some((&octant, rest)) => {
                let child = node.children[octant as usize & 7]
                    .get_or_insert_with(|| Box::new(VoxelNode::default()));
                Self::set_inner(child, rest, color, timestamp_us);
                node.touch(timestamp_us);
            }
        }
    }

    /// 경로 위치 서브트리 삭제, 있었으면 true
    pub fn erase_voxel(&mut self, path: &[u8], timestamp_us: u64) -> bool {
        if path.is_empty() {
            return false;
        }
        Self::erase_inner(&mut self.root, path, timestamp_us)
    }

    fn erase_inner(node: &mut VoxelNode, path: &[u8], timestamp_us: u64) -> bool {
        let erased = match path.split_first() {
            None => false,
            Some((&octant, [])) => node.children[octant as usize & 7].take().is_some(),
            Some((&octant, rest)) => match node.children[octant as usize & 7].as_deref_mut() {
                Some(child) => Self::erase_inner(child, rest, timestamp_us),
                None => false,
            },
        };
        if erased {
            node.touch(timestamp_us);
        }
        erased
    }

    /// 경로 위치 색상 조회
    pub fn voxel_at(&self, path: &[u8]) -> Option<[u8; 3]> {
        let mut node = &self.root;
        for &octant in path {
            node = node.children[octant as usize & 7].as_deref()?;
        }
        node.color
    }

    /// 전체 노드 수 (루트 포함)
    pub fn element_count(&self) -> usize {
        fn count(node: &VoxelNode) -> usize {
            1 + node
                .children
                .iter()
                .filter_map(|slot| slot.as_deref())
                .map(count)
                .sum::<usize>()
        }
        count(&self.root)
    }
}

impl WorldContent for VoxelTree {
    fn root(&self) -> &dyn TreeElement {
        &self.root
    }

    fn root_cube(&self) -> Cube {
        self.root_cube
    }

    fn handles_edit(&self, kind: PacketKind) -> bool {
        matches!(kind, PacketKind::EditSet | PacketKind::EditErase)
    }

    fn apply_edit(
        &mut self,
        kind: PacketKind,
        record: &[u8],
        timestamp_us: u64,
    ) -> Result<EditApplied> {
        let (path, mut consumed) = parse_edit_path(record)?;
        match kind {
            PacketKind::EditSet => {
                if record.len() < consumed + 3 {
                    return Err(Error::TruncatedPacket {
                        needed: consumed + 3,
                        got: record.len(),
                    });
                }
                let color = [record[consumed], record[consumed + 1], record[consumed + 2]];
                consumed += 3;
                self.set_voxel(&path, color, timestamp_us)?;
                Ok(EditApplied {
                    consumed,
                    deleted_id: None,
                })
            }
            PacketKind::EditErase => {
                let existed = self.erase_voxel(&path, timestamp_us);
                Ok(EditApplied {
                    consumed,
                    deleted_id: existed.then(|| pack_path(&path)),
                })
            }
            other => Err(Error::UnknownEditKind { kind: other as u8 }),
        }
    }
}

/// 편집 레코드 공통 경로부 파싱: (경로, 소비 바이트)
fn parse_edit_path(record: &[u8]) -> Result<(Vec<u8>, usize)> {
    if record.is_empty() {
        return Err(Error::TruncatedPacket { needed: 1, got: 0 });
    }
    let depth = record[0] as usize;
    if depth > MAX_PATH_DEPTH {
        return Err(Error::PathTooDeep {
            depth,
            max: MAX_PATH_DEPTH,
        });
    }
    let needed = 1 + packed_len(depth);
    if record.len() < needed {
        return Err(Error::TruncatedPacket {
            needed,
            got: record.len(),
        });
    }
    let path = unpack_octants(depth, &record[1..needed]);
    Ok((path, needed))
}

/// 복셀 설정 편집 레코드 생성
pub fn encode_set_record(path: &[u8], color: [u8; 3]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + packed_len(path.len()) + 3);
    out.push(path.len() as u8);
    out.extend_from_slice(&pack_octants(path));
    out.extend_from_slice(&color);
    out
}

/// 복셀 삭제 편집 레코드 생성
pub fn encode_erase_record(path: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + packed_len(path.len()));
    out.push(path.len() as u8);
    out.extend_from_slice(&pack_octants(path));
    out
}

/// 스트림 원소 레코드 (디코딩 측)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRecord {
    /// 루트 기준 옥탄트 경로
    pub path: Vec<u8>,

    /// 자식 존재 마스크
    pub child_mask: u8,

    /// 색상 (최소 표현이면 None)
    pub color: Option<[u8; 3]>,
}

impl ElementRecord {
    /// 한 레코드 파싱: (레코드, 소비 바이트)
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        let (path, mut consumed) = parse_edit_path(bytes)?;
        if bytes.len() < consumed + 2 {
            return Err(Error::TruncatedPacket {
                needed: consumed + 2,
                got: bytes.len(),
            });
        }
        let child_mask = bytes[consumed];
        let has_color = bytes[consumed + 1];
        consumed += 2;
        let color = if has_color != 0 {
            if bytes.len() < consumed + 3 {
                return Err(Error::TruncatedPacket {
                    needed: consumed + 3,
                    got: bytes.len(),
                });
            }
            let color = [bytes[consumed], bytes[consumed + 1], bytes[consumed + 2]];
            consumed += 3;
            Some(color)
        } else {
            None
        };
        Ok((
            Self {
                path,
                child_mask,
                color,
            },
            consumed,
        ))
    }

    /// 페이로드 전체를 레코드 목록으로 파싱
    pub fn parse_all(mut bytes: &[u8]) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let (record, consumed) = Self::parse(bytes)?;
            out.push(record);
            bytes = &bytes[consumed..];
        }
        Ok(out)
    }
}
