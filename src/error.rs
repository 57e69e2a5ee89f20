//! 에러 타입 정의

use thiserror::Error;

/// OVS 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("패킷 잘림: 필요 {needed} 바이트, 수신 {got} 바이트")]
    TruncatedPacket { needed: usize, got: usize },

    #[error("알 수 없는 패킷 타입: {kind:#04X}")]
    UnknownPacketKind { kind: u8 },

    #[error("페이로드 크기 초과: {size} > 최대 {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("압축 실패: {0}")]
    Compress(#[source] std::io::Error),

    #[error("압축 해제 실패: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("알 수 없는 편집 타입: {kind:#04X}")]
    UnknownEditKind { kind: u8 },

    #[error("편집 레코드 거부: {reason}")]
    EditRejected { reason: String },

    #[error("트리 경로 초과: 깊이 {depth}, 최대 {max}")]
    PathTooDeep { depth: usize, max: usize },

    #[error("채널 에러")]
    ChannelError,

    #[error("세션 없음: {addr}")]
    SessionNotFound { addr: std::net::SocketAddr },

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
