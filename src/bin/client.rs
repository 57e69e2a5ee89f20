//! OVS 뷰어 클라이언트 - Octree View Stream
//!
//! 뷰 질의를 보내고 옥트리 스트림을 수신해 장면을 복원한다.
//! - 시퀀스 추적으로 누락을 찾아 스트림 NACK 전송
//! - 수신 손실 시뮬레이션과 장면 다이제스트 검증
//! - 선택적으로 편집 패킷을 보내 편집자 역할도 겸한다
//!
//! 사용법:
//!   cargo run --release --bin ovs-client -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신 (원점을 바라보는 뷰어)
//!   cargo run --release --bin ovs-client -- --server 127.0.0.1:9000
//!
//!   # 20% 수신 손실 시뮬레이션, 10초 후 종료
//!   cargo run --release --bin ovs-client -- --loss 0.2 --duration 10

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use glam::{Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ovs::buffer::unpack_sections;
use ovs::sequence::{SequenceEvent, SequenceWindow};
use ovs::tree::pack_path;
use ovs::voxel::{encode_erase_record, encode_set_record, ElementRecord};
use ovs::wire::{
    decode_deletion_body, decode_nack_body, encode_nack_body, encode_packet, PacketHeader,
    PacketKind, QueryMessage, SceneStatsMessage, PACKET_HEADER_SIZE,
};

/// 클라이언트 실행 옵션
struct ClientOpts {
    bind_addr: SocketAddr,
    server_addr: SocketAddr,
    position: [f32; 3],
    target: [f32; 3],
    fov_deg: f32,
    far_clip: f32,
    rate: u32,
    loss: f64,
    duration_secs: u64,
    edit_interval_ms: u64,
    seed: u64,
}

impl Default for ClientOpts {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            server_addr: "127.0.0.1:9000".parse().unwrap(),
            position: [0.0, 0.0, 400.0],
            target: [0.0, 0.0, 0.0],
            fov_deg: 70.0,
            far_clip: 2000.0,
            rate: 0,
            loss: 0.0,
            duration_secs: 0,
            edit_interval_ms: 0,
            seed: 7,
        }
    }
}

fn parse_vec3(text: &str) -> [f32; 3] {
    let parts: Vec<f32> = text
        .split(',')
        .map(|part| part.trim().parse().expect("유효한 좌표 필요 (x,y,z)"))
        .collect();
    if parts.len() != 3 {
        eprintln!("좌표는 x,y,z 형식이어야 합니다: {text}");
        std::process::exit(1);
    }
    [parts[0], parts[1], parts[2]]
}

fn parse_args() -> ClientOpts {
    let args: Vec<String> = std::env::args().collect();
    let mut opts = ClientOpts::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    opts.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    opts.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--position" => {
                if i + 1 < args.len() {
                    opts.position = parse_vec3(&args[i + 1]);
                    i += 1;
                }
            }
            "--target" => {
                if i + 1 < args.len() {
                    opts.target = parse_vec3(&args[i + 1]);
                    i += 1;
                }
            }
            "--fov" => {
                if i + 1 < args.len() {
                    opts.fov_deg = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--far" => {
                if i + 1 < args.len() {
                    opts.far_clip = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--rate" => {
                if i + 1 < args.len() {
                    opts.rate = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--loss" => {
                if i + 1 < args.len() {
                    opts.loss = args[i + 1].parse().expect("유효한 비율 필요 (0.0~1.0)");
                    i += 1;
                }
            }
            "--duration" | "-d" => {
                if i + 1 < args.len() {
                    opts.duration_secs = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--edit-interval" => {
                if i + 1 < args.len() {
                    opts.edit_interval_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--seed" => {
                if i + 1 < args.len() {
                    opts.seed = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"OVS Client - Octree View Stream 뷰어 클라이언트

뷰 질의를 보내고 옥트리 스트림을 수신해 장면을 복원한다
- 누락 시퀀스만 NACK으로 요청
- 수신 손실 시뮬레이션과 장면 다이제스트 출력

사용법:
  cargo run --release --bin ovs-client -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       로컬 바인드 주소 (기본: 0.0.0.0:0 = 자동 할당)
  -s, --server <ADDR>     서버 주소 (기본: 127.0.0.1:9000)
  --position <X,Y,Z>      뷰어 위치 (기본: 0,0,400)
  --target <X,Y,Z>        바라볼 지점 (기본: 0,0,0)
  --fov <DEG>             시야각 (기본: 70)
  --far <DIST>            원거리 클립 (기본: 2000)
  --rate <PPS>            요청 전송률, 0이면 서버 기본값 (기본: 0)
  --loss <RATIO>          수신 손실 시뮬레이션 0.0~1.0 (기본: 0)
  -d, --duration <SECS>   실행 시간, 0이면 Ctrl-C까지 (기본: 0)
  --edit-interval <MS>    편집 전송 주기, 0이면 비활성 (기본: 0)
  --seed <N>              난수 시드 (기본: 7)
  -h, --help              이 도움말 출력

예시:
  # 다른 위치에서 관찰
  cargo run --release --bin ovs-client -- --position 100,50,300

  # 30% 손실 네트워크 흉내 + 편집자 역할
  cargo run --release --bin ovs-client -- --loss 0.3 --edit-interval 250
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    opts
}

/// -Z 전방 기준, 위치에서 목표를 바라보는 쿼터니언
fn orientation_toward(position: [f32; 3], target: [f32; 3]) -> [f32; 4] {
    let forward = (Vec3::from(target) - Vec3::from(position)).normalize_or_zero();
    if forward == Vec3::ZERO {
        return [0.0, 0.0, 0.0, 1.0];
    }
    Quat::from_rotation_arc(Vec3::NEG_Z, forward).to_array()
}

/// 수신해서 복원한 원소 하나
struct ElementState {
    child_mask: u8,
    color: Option<[u8; 3]>,
}

/// 수신 집계
#[derive(Default)]
struct ClientTally {
    packets: u64,
    bytes: u64,
    elements: u64,
    deletions: u64,
    scenes: u64,
    nacks_sent: u64,
    edits_sent: u64,
    edit_resends: u64,
    simulated_drops: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let opts = parse_args();

    info!("OVS Client starting...");
    info!("Server address: {}", opts.server_addr);
    info!(
        "Viewer at ({:.0}, {:.0}, {:.0}) looking at ({:.0}, {:.0}, {:.0})",
        opts.position[0],
        opts.position[1],
        opts.position[2],
        opts.target[0],
        opts.target[1],
        opts.target[2]
    );
    if opts.loss > 0.0 {
        info!("Simulated receive loss: {:.0}%", opts.loss * 100.0);
    }

    let socket = UdpSocket::bind(opts.bind_addr).await?;
    info!("Bound to local address: {}", socket.local_addr()?);

    let server_addr = opts.server_addr;
    let query = QueryMessage {
        position: opts.position,
        orientation: orientation_toward(opts.position, opts.target),
        fov_deg: opts.fov_deg,
        near_clip: 0.1,
        far_clip: opts.far_clip,
        size_scale: 0.0,
        boundary_level_adjust: 0,
        max_packets_per_second: opts.rate,
    };

    // 수신 장면 상태와 스트림 시퀀스 추적
    let mut scene: HashMap<u64, ElementState> = HashMap::new();
    let mut window = SequenceWindow::new(4096, 1000);
    let mut tally = ClientTally::default();

    // 편집자 상태: 보낸 편집 이력은 편집 NACK 재전송에 쓴다
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut edit_seq: u16 = 0;
    let mut query_seq: u16 = 0;
    let mut edit_history: HashMap<u16, Bytes> = HashMap::new();

    let started = Instant::now();
    let deadline = (opts.duration_secs > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(opts.duration_secs));

    let mut query_ticker = tokio::time::interval(Duration::from_millis(500));
    let mut nack_ticker = tokio::time::interval(Duration::from_millis(200));
    let mut edit_ticker =
        tokio::time::interval(Duration::from_millis(opts.edit_interval_ms.max(1)));
    let mut progress_ticker = tokio::time::interval(Duration::from_secs(2));

    let mut buf = vec![0u8; 65535];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                if from != server_addr {
                    continue;
                }
                if opts.loss > 0.0 && rng.gen_bool(opts.loss) {
                    tally.simulated_drops += 1;
                    continue;
                }
                tally.packets += 1;
                tally.bytes += len as u64;
                handle_packet(
                    &buf[..len],
                    &socket,
                    server_addr,
                    &mut scene,
                    &mut window,
                    &edit_history,
                    &mut tally,
                )
                .await;
            }

            _ = query_ticker.tick() => {
                let header = PacketHeader::new(PacketKind::Query, 0, query_seq);
                query_seq = query_seq.wrapping_add(1);
                let bytes = encode_packet(&header, &query.to_bytes());
                socket.send_to(&bytes, server_addr).await?;
            }

            _ = nack_ticker.tick() => {
                window.prune();
                let missing = window.missing();
                if !missing.is_empty() {
                    let wanted = &missing[..missing.len().min(64)];
                    let header = PacketHeader::new(PacketKind::StreamNack, 0, 0);
                    let bytes = encode_packet(&header, &encode_nack_body(wanted));
                    socket.send_to(&bytes, server_addr).await?;
                    tally.nacks_sent += 1;
                    debug!(count = wanted.len(), "스트림 NACK 전송");
                }
            }

            _ = edit_ticker.tick(), if opts.edit_interval_ms > 0 => {
                let depth = rng.gen_range(2..=4);
                let path: Vec<u8> = (0..depth).map(|_| rng.gen_range(0..8u8)).collect();
                let (kind, record) = if rng.gen_bool(0.25) {
                    (PacketKind::EditErase, encode_erase_record(&path))
                } else {
                    let color = [rng.gen(), rng.gen(), rng.gen()];
                    (PacketKind::EditSet, encode_set_record(&path, color))
                };
                let header = PacketHeader::new(kind, 0, edit_seq);
                let bytes = encode_packet(&header, &record);
                edit_history.insert(edit_seq, bytes.clone());
                // 이력은 최근 1024개만 유지
                edit_history.remove(&edit_seq.wrapping_sub(1024));
                edit_seq = edit_seq.wrapping_add(1);
                socket.send_to(&bytes, server_addr).await?;
                tally.edits_sent += 1;
            }

            _ = progress_ticker.tick() => {
                if started.elapsed() > Duration::from_secs(1) {
                    info!(
                        "Progress: {} elements live, {} packets, {} missing, {} NACKs",
                        scene.len(),
                        tally.packets,
                        window.missing_count(),
                        tally.nacks_sent
                    );
                }
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(|| {
                tokio::time::Instant::now() + Duration::from_secs(3600)
            })), if deadline.is_some() => {
                info!("Duration reached");
                break;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // === 결과 정리 ===
    let elapsed = started.elapsed();
    info!("Session complete!");
    info!("  Time: {:.2}s", elapsed.as_secs_f64());
    info!("  Packets: {} ({} bytes)", tally.packets, tally.bytes);
    info!("  Element records: {}", tally.elements);
    info!("  Live elements: {}", scene.len());
    info!("  Scenes completed: {}", tally.scenes);
    info!("  Deletions applied: {}", tally.deletions);
    info!(
        "  Stream: {} missing, {} dup, {} NACKs sent",
        window.missing_count(),
        window.duplicates,
        tally.nacks_sent
    );
    if opts.loss > 0.0 {
        info!("  Simulated drops: {}", tally.simulated_drops);
    }
    if opts.edit_interval_ms > 0 {
        info!(
            "  Edits sent: {} (+{} resends)",
            tally.edits_sent, tally.edit_resends
        );
    }
    info!("  Scene digest: {:08x}", scene_digest(&scene));

    Ok(())
}

/// 수신 패킷 1건 처리
async fn handle_packet(
    data: &[u8],
    socket: &UdpSocket,
    server_addr: SocketAddr,
    scene: &mut HashMap<u64, ElementState>,
    window: &mut SequenceWindow,
    edit_history: &HashMap<u16, Bytes>,
    tally: &mut ClientTally,
) {
    let header = match PacketHeader::from_bytes(data) {
        Ok(header) => header,
        Err(error) => {
            warn!(%error, "헤더 해석 실패");
            return;
        }
    };
    let payload = &data[PACKET_HEADER_SIZE..];

    match header.packet_kind() {
        Ok(PacketKind::OctreeData) => {
            // 재전송 중복은 장면에 다시 반영하지 않는다
            if window.record(header.sequence) == SequenceEvent::Duplicate {
                return;
            }
            let content = match unpack_sections(payload, header.is_compressed()) {
                Ok(content) => content,
                Err(error) => {
                    warn!(%error, sequence = header.sequence, "섹션 해제 실패");
                    return;
                }
            };
            match ElementRecord::parse_all(&content) {
                Ok(records) => {
                    for record in records {
                        let id = pack_path(&record.path);
                        scene.insert(
                            id,
                            ElementState {
                                child_mask: record.child_mask,
                                color: record.color,
                            },
                        );
                        tally.elements += 1;
                    }
                }
                Err(error) => warn!(%error, "원소 레코드 파싱 실패"),
            }
        }

        Ok(PacketKind::SceneStats) => {
            if window.record(header.sequence) == SequenceEvent::Duplicate {
                return;
            }
            match SceneStatsMessage::from_bytes(payload) {
                Ok(message) => {
                    tally.scenes += 1;
                    info!(
                        "Scene {} complete: {} elements in {} packets ({} bytes, encode {}us)",
                        message.scene_generation,
                        message.elements_sent,
                        message.packets,
                        message.bytes,
                        message.encode_us
                    );
                }
                Err(error) => warn!(%error, "씬 통계 해석 실패"),
            }
        }

        Ok(PacketKind::DeletionList) => {
            if window.record(header.sequence) == SequenceEvent::Duplicate {
                return;
            }
            match decode_deletion_body(payload) {
                Ok(ids) => {
                    for id in ids {
                        if scene.remove(&id).is_some() {
                            tally.deletions += 1;
                        }
                    }
                }
                Err(error) => warn!(%error, "삭제 목록 해석 실패"),
            }
        }

        Ok(PacketKind::EditNack) => {
            // 서버가 못 받은 편집을 이력에서 재전송
            match decode_nack_body(payload) {
                Ok(sequences) => {
                    for sequence in sequences {
                        if let Some(bytes) = edit_history.get(&sequence) {
                            if socket.send_to(bytes, server_addr).await.is_ok() {
                                tally.edit_resends += 1;
                            }
                        } else {
                            debug!(sequence, "이력에 없는 편집 NACK");
                        }
                    }
                }
                Err(error) => warn!(%error, "편집 NACK 해석 실패"),
            }
        }

        Ok(other) => {
            debug!(?other, "클라이언트가 쓰지 않는 패킷 타입");
        }

        Err(error) => {
            warn!(%error, "알 수 없는 패킷 타입");
        }
    }
}

/// 장면 내용의 안정적인 다이제스트 (원소 ID 정렬 후 CRC32)
fn scene_digest(scene: &HashMap<u64, ElementState>) -> u32 {
    let mut ids: Vec<u64> = scene.keys().copied().collect();
    ids.sort_unstable();
    let mut hasher = crc32fast::Hasher::new();
    for id in ids {
        let state = &scene[&id];
        hasher.update(&id.to_le_bytes());
        hasher.update(&[state.child_mask]);
        match state.color {
            Some(color) => hasher.update(&color),
            None => hasher.update(&[0]),
        }
    }
    hasher.finalize()
}
