//! 패킷 섹션 버퍼
//!
//! 트리 원소 인코딩을 누적하는 소유 버퍼. 전량 기록 아니면 무기록의
//! append 계약을 지키고, 압축 모드에서는 압축 결과 크기로 예산을 판정한다.
//! 하나의 버퍼 내용이 데이터그램의 섹션 하나가 된다.

use tracing::warn;

use crate::error::{Error, Result};

/// 압축 모드에서 허용하는 미압축 누적 상한 (바이트)
///
/// 압축 전 내용은 목표 크기보다 커질 수 있다. 이 상한은 압축률과
/// 무관하게 스테이징이 무한히 자라는 것만 막는다.
pub const MAX_UNCOMPRESSED_STAGING: usize = 4096;

/// 레벨 되감기 키
///
/// 섹션 안에서 선택 필드 단위의 원자성을 만든다. LIFO로만 사용한다.
#[derive(Debug, Clone, Copy)]
pub struct LevelKey {
    start: usize,
}

/// 섹션 단위 패킷 버퍼
#[derive(Debug)]
pub struct PacketBuffer {
    /// 미압축 내용
    content: Vec<u8>,

    /// 완성본(압축본)이 들어가야 하는 예산
    target_size: usize,

    /// 압축 모드
    compress: bool,

    /// zstd 레벨
    zstd_level: i32,

    /// 압축 결과 캐시
    compressed: Vec<u8>,

    /// 내용 변경 후 재압축 필요 여부
    dirty: bool,

    /// 열린 섹션의 시작 오프셋
    section_start: Option<usize>,
}

impl PacketBuffer {
    /// 새 버퍼 생성
    pub fn new(compress: bool, zstd_level: i32, target_size: usize) -> Self {
        Self {
            content: Vec::with_capacity(target_size),
            target_size,
            compress,
            zstd_level,
            compressed: Vec::new(),
            dirty: false,
            section_start: None,
        }
    }

    /// 설정 변경: 내용을 비우고 새 예산을 잡는다
    pub fn change_settings(&mut self, compress: bool, target_size: usize) {
        self.compress = compress;
        self.target_size = target_size;
        self.reset();
    }

    /// 내용만 비우고 설정 유지
    pub fn reset(&mut self) {
        self.content.clear();
        self.compressed.clear();
        self.dirty = false;
        self.section_start = None;
    }

    /// 내용 존재 여부
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    /// 미압축 내용 길이
    pub fn content_len(&self) -> usize {
        self.content.len()
    }

    /// 현재 예산
    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// 압축 모드 여부
    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    /// 스테이징 잔여 공간
    pub fn remaining(&self) -> usize {
        let cap = if self.compress {
            MAX_UNCOMPRESSED_STAGING
        } else {
            self.target_size
        };
        cap.saturating_sub(self.content.len())
    }

    /// 전량 기록 아니면 무기록 append
    ///
    /// 비압축: 내용 길이가 예산을 넘으면 기록하지 않는다.
    /// 압축: 스테이징 상한 검사 후 기록하고, 내용이 예산을 넘어섰으면
    /// 압축 결과가 예산에 드는지 확인한다. 안 들면 이번 기록을 되돌린다.
    pub fn append(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }

        if !self.compress {
            if self.content.len() + data.len() > self.target_size {
                return false;
            }
            self.content.extend_from_slice(data);
            return true;
        }

        if self.content.len() + data.len() > MAX_UNCOMPRESSED_STAGING {
            return false;
        }
        self.content.extend_from_slice(data);
        self.dirty = true;

        if self.content.len() > self.target_size {
            match self.compressed_size() {
                Ok(size) if size <= self.target_size => true,
                Ok(_) => {
                    self.content.truncate(self.content.len() - data.len());
                    self.dirty = true;
                    false
                }
                Err(err) => {
                    warn!("압축 크기 계산 실패, append 거부: {}", err);
                    self.content.truncate(self.content.len() - data.len());
                    self.dirty = true;
                    false
                }
            }
        } else {
            true
        }
    }

    /// 섹션 시작
    pub fn begin_section(&mut self) {
        self.section_start = Some(self.content.len());
    }

    /// 섹션 확정
    pub fn end_section(&mut self) {
        self.section_start = None;
    }

    /// 섹션 폐기: 시작 지점까지 되감는다
    pub fn discard_section(&mut self) {
        if let Some(start) = self.section_start.take() {
            self.content.truncate(start);
            self.dirty = true;
        }
    }

    /// 레벨 시작: 되감기 키 반환
    pub fn begin_level(&mut self) -> LevelKey {
        LevelKey {
            start: self.content.len(),
        }
    }

    /// 레벨 확정
    pub fn end_level(&mut self, _key: LevelKey) {}

    /// 레벨 폐기: 키 지점까지 되감는다
    pub fn discard_level(&mut self, key: LevelKey) {
        self.content.truncate(key.start);
        self.dirty = true;
    }

    /// 완성 크기 (압축 모드면 압축 후 크기)
    ///
    /// 압축 실패 시 보수적으로 미압축 길이를 쓴다.
    pub fn finalized_size(&mut self) -> usize {
        if !self.compress {
            return self.content.len();
        }
        match self.compressed_size() {
            Ok(size) => size,
            Err(err) => {
                warn!("압축 실패, 미압축 크기로 대체: {}", err);
                self.content.len()
            }
        }
    }

    /// 완성본 추출: 압축 모드면 압축 결과, 아니면 원본
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        if !self.compress {
            return Ok(self.content.clone());
        }
        self.ensure_compressed()?;
        Ok(self.compressed.clone())
    }

    /// 압축 결과 크기 (캐시 사용)
    fn compressed_size(&mut self) -> Result<usize> {
        self.ensure_compressed()?;
        Ok(self.compressed.len())
    }

    /// dirty면 재압축
    fn ensure_compressed(&mut self) -> Result<()> {
        if self.dirty || (self.compressed.is_empty() && !self.content.is_empty()) {
            self.compressed =
                zstd::bulk::compress(&self.content, self.zstd_level).map_err(Error::Compress)?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// 수신 측 섹션 해제
///
/// 압축 플래그가 켜진 페이로드는 u16 길이 프리픽스가 붙은 섹션들의
/// 나열이고, 꺼진 페이로드는 원본 그대로다. 반환값은 모든 섹션을
/// 풀어 이어 붙인 내용이다.
pub fn unpack_sections(payload: &[u8], compressed: bool) -> Result<Vec<u8>> {
    if !compressed {
        return Ok(payload.to_vec());
    }

    let mut out = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(Error::TruncatedPacket {
                needed: 2,
                got: rest.len(),
            });
        }
        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if rest.len() < len {
            return Err(Error::TruncatedPacket {
                needed: len,
                got: rest.len(),
            });
        }
        let section = zstd::bulk::decompress(&rest[..len], MAX_UNCOMPRESSED_STAGING)
            .map_err(Error::Decompress)?;
        out.extend_from_slice(&section);
        rest = &rest[len..];
    }
    Ok(out)
}
