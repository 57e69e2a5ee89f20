//! # OVS (Octree View Stream)
//!
//! 뷰 주도 옥트리 스트리밍 프로토콜 엔진
//!
//! ## 핵심 특징
//! - **뷰 주도 순회**: 클라이언트 절두체와 LOD 경계로 보낼 원소를 고른다
//! - **우선순위 스트림**: 화면 기여도가 큰 원소부터 패킷에 담는다
//! - **MTU 패킹**: 섹션 단위 전부 아니면 무(all-or-nothing) 채움 + zstd 압축
//! - **NACK 재전송**: ACK 없이 누락 시퀀스만 요청, 이력에서 그대로 재송
//! - **델타 패스**: 변경 시각 스탬프로 바뀐 서브트리만 재전송
//! - **편집 인제스트**: 편집 스트림 누락 감지와 역방향 NACK
//! - **전송률 제한**: 클라이언트별 예산과 서버 전역 윈도우 이중 제한

pub mod buffer;
pub mod config;
pub mod distributor;
pub mod error;
pub mod frustum;
pub mod history;
pub mod inbound;
pub mod sequence;
pub mod server;
pub mod session;
pub mod stats;
pub mod traversal;
pub mod tree;
pub mod voxel;
pub mod wire;

pub use buffer::PacketBuffer;
pub use config::StreamConfig;
pub use error::{Error, Result};
pub use frustum::{Containment, Cube, DetailParams, ViewFrustum};
pub use history::PacketHistory;
pub use sequence::{SequenceEvent, SequenceWindow};
pub use server::{Server, ServerContext};
pub use session::ClientSession;
pub use stats::{SceneStats, ServerCounters};
pub use traversal::{Traversal, TraversalMode};
pub use tree::{TreeElement, WorldContent};
pub use voxel::VoxelTree;
pub use wire::{Datagram, PacketHeader, PacketKind, QueryMessage};

/// 기본 최대 패킷 크기 (바이트, UDP MTU 안전 범위)
pub const MAX_PACKET_SIZE: usize = 1450;

/// 초당 배포 주기 수
pub const INTERVALS_PER_SECOND: u32 = 60;
