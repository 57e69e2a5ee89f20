//! 와이어 포맷 정의
//!
//! 모든 데이터그램은 12바이트 고정 헤더로 시작한다:
//! 타입(1) + 플래그(1) + 시퀀스(2) + 송신 시각(8), 리틀 엔디언.
//! 가변 본문은 타입별로 정의된다.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 고정 헤더 크기 (바이트)
pub const PACKET_HEADER_SIZE: usize = 12;

/// 플래그 비트: 색상(풀 디테일) 포함
pub const FLAG_COLOR: u8 = 0x01;

/// 플래그 비트: 페이로드 압축됨
pub const FLAG_COMPRESSED: u8 = 0x02;

/// 압축 섹션 길이 프리픽스 크기 (바이트)
pub const SECTION_PREFIX_SIZE: usize = 2;

/// 현재 시각 (마이크로초, epoch 기준)
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// 옥트리 데이터 (서버 → 뷰어)
    OctreeData = 1,

    /// 씬 통계 (서버 → 뷰어)
    SceneStats = 2,

    /// 삭제 목록 (서버 → 뷰어)
    DeletionList = 3,

    /// 스트림 NACK (뷰어 → 서버, 옥트리 스트림 누락 요청)
    StreamNack = 4,

    /// 복셀 설정 편집 (편집자 → 서버)
    EditSet = 5,

    /// 복셀 삭제 편집 (편집자 → 서버)
    EditErase = 6,

    /// 편집 NACK (서버 → 편집자, 편집 스트림 누락 통지)
    EditNack = 7,

    /// 뷰 질의 (뷰어 → 서버)
    Query = 8,
}

impl PacketKind {
    /// 바이트에서 변환
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketKind::OctreeData),
            2 => Ok(PacketKind::SceneStats),
            3 => Ok(PacketKind::DeletionList),
            4 => Ok(PacketKind::StreamNack),
            5 => Ok(PacketKind::EditSet),
            6 => Ok(PacketKind::EditErase),
            7 => Ok(PacketKind::EditNack),
            8 => Ok(PacketKind::Query),
            kind => Err(Error::UnknownPacketKind { kind }),
        }
    }

    /// 편집 패킷 여부
    pub fn is_edit(&self) -> bool {
        matches!(self, PacketKind::EditSet | PacketKind::EditErase)
    }
}

/// 데이터그램 고정 헤더
///
/// kind는 bincode가 enum을 4바이트 태그로 쓰는 것을 피하려고 u8로 둔다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// 패킷 타입 (PacketKind)
    pub kind: u8,

    /// 플래그 비트
    pub flags: u8,

    /// 세션 시퀀스 번호 (순환)
    pub sequence: u16,

    /// 송신 시각 (마이크로초, epoch 기준)
    pub sent_at_us: u64,
}

impl PacketHeader {
    /// 새 헤더 생성, 송신 시각은 현재 시각
    pub fn new(kind: PacketKind, flags: u8, sequence: u16) -> Self {
        Self {
            kind: kind as u8,
            flags,
            sequence,
            sent_at_us: now_us(),
        }
    }

    /// 타입 해석
    pub fn packet_kind(&self) -> Result<PacketKind> {
        PacketKind::from_u8(self.kind)
    }

    /// 압축 플래그 여부
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// 바이트로 직렬화 (12바이트 고정)
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// 바이트에서 역직렬화, 페이로드는 뒤에 이어짐
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(Error::TruncatedPacket {
                needed: PACKET_HEADER_SIZE,
                got: bytes.len(),
            });
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

/// 헤더와 본문을 데이터그램 바이트로 조립
pub fn encode_packet(header: &PacketHeader, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(PACKET_HEADER_SIZE + body.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(body);
    out.freeze()
}

/// NACK 본문 직렬화: 개수(u16) + 시퀀스 번호들(u16)
pub fn encode_nack_body(sequences: &[u16]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2 + sequences.len() * 2);
    buf.put_u16_le(sequences.len() as u16);
    for &seq in sequences {
        buf.put_u16_le(seq);
    }
    buf.to_vec()
}

/// NACK 본문 역직렬화
pub fn decode_nack_body(mut body: &[u8]) -> Result<Vec<u16>> {
    if body.len() < 2 {
        return Err(Error::TruncatedPacket {
            needed: 2,
            got: body.len(),
        });
    }
    let count = body.get_u16_le() as usize;
    if body.len() < count * 2 {
        return Err(Error::TruncatedPacket {
            needed: count * 2,
            got: body.len(),
        });
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(body.get_u16_le());
    }
    Ok(out)
}

/// 삭제 목록 본문 직렬화: 개수(u16) + 원소 ID들(u64)
pub fn encode_deletion_body(ids: &[u64]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2 + ids.len() * 8);
    buf.put_u16_le(ids.len() as u16);
    for &id in ids {
        buf.put_u64_le(id);
    }
    buf.to_vec()
}

/// 삭제 목록 본문 역직렬화
pub fn decode_deletion_body(mut body: &[u8]) -> Result<Vec<u64>> {
    if body.len() < 2 {
        return Err(Error::TruncatedPacket {
            needed: 2,
            got: body.len(),
        });
    }
    let count = body.get_u16_le() as usize;
    if body.len() < count * 8 {
        return Err(Error::TruncatedPacket {
            needed: count * 8,
            got: body.len(),
        });
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(body.get_u64_le());
    }
    Ok(out)
}

/// 씬 통계 본문 (bincode)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SceneStatsMessage {
    /// 씬 세대 번호
    pub scene_generation: u64,

    /// 직전 씬에서 방문한 원소 수
    pub elements_visited: u64,

    /// 직전 씬에서 전송한 원소 수
    pub elements_sent: u64,

    /// 직전 씬 패킷 수
    pub packets: u64,

    /// 직전 씬 바이트 수
    pub bytes: u64,

    /// 직전 씬 인코딩 시간 (마이크로초)
    pub encode_us: u64,
}

impl SceneStatsMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// 뷰 질의 본문 (bincode)
///
/// glam 타입은 배열로 풀어서 싣는다.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueryMessage {
    /// 뷰어 위치
    pub position: [f32; 3],

    /// 뷰어 방향 (쿼터니언 x, y, z, w)
    pub orientation: [f32; 4],

    /// 시야각 (도)
    pub fov_deg: f32,

    /// 근거리 클립
    pub near_clip: f32,

    /// 원거리 클립
    pub far_clip: f32,

    /// 옥트리 크기 스케일 (LOD)
    pub size_scale: f32,

    /// 경계 레벨 보정 (LOD)
    pub boundary_level_adjust: i32,

    /// 요청 최대 전송률 (패킷/초, 0이면 서버 기본값)
    pub max_packets_per_second: u32,
}

impl QueryMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// 목적지가 붙은 송신 단위
#[derive(Debug, Clone)]
pub struct Datagram {
    /// 수신자 주소
    pub dest: SocketAddr,

    /// 헤더 포함 전체 바이트
    pub bytes: Bytes,
}

impl Datagram {
    pub fn new(dest: SocketAddr, bytes: Bytes) -> Self {
        Self { dest, bytes }
    }
}
