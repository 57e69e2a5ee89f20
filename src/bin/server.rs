//! OVS 서버 - Octree View Stream
//!
//! 뷰 주도 옥트리 스트리밍 서버
//! - 절차 생성 복셀 장면을 UDP로 스트리밍
//! - 뷰어 질의 / 스트림 NACK / 편집 패킷 처리
//!
//! 사용법:
//!   cargo run --release --bin ovs-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 실행 (복셀 2000개 장면)
//!   cargo run --release --bin ovs-server -- --bind 0.0.0.0:9000
//!
//!   # 손실 네트워크 프리셋 + 장면 교란
//!   cargo run --release --bin ovs-server -- --preset lossy --edit-interval 100

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ovs::server::{Server, ServerContext};
use ovs::tree::{pack_path, WorldContent};
use ovs::voxel::VoxelTree;
use ovs::wire::now_us;
use ovs::StreamConfig;

/// 서버 실행 옵션
struct ServerOpts {
    bind_addr: SocketAddr,
    voxels: usize,
    seed: u64,
    edit_interval_ms: u64,
    config: StreamConfig,
}

impl Default for ServerOpts {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".parse().unwrap(),
            voxels: 2000,
            seed: 42,
            edit_interval_ms: 0,
            config: StreamConfig::default(),
        }
    }
}

fn parse_args() -> ServerOpts {
    let args: Vec<String> = std::env::args().collect();
    let mut opts = ServerOpts::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    opts.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--preset" | "-p" => {
                if i + 1 < args.len() {
                    opts.config = match args[i + 1].as_str() {
                        "lan" => StreamConfig::lan(),
                        "wan" => StreamConfig::wan(),
                        "lossy" => StreamConfig::lossy_network(),
                        other => {
                            eprintln!("알 수 없는 프리셋: {other} (lan|wan|lossy)");
                            std::process::exit(1);
                        }
                    };
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    opts.config.max_packet_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--rate" => {
                if i + 1 < args.len() {
                    opts.config.client_packets_per_second =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--server-rate" => {
                if i + 1 < args.len() {
                    opts.config.server_packets_per_second =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--no-compress" => {
                opts.config.compress = false;
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    opts.config.inbound_workers = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--voxels" | "-n" => {
                if i + 1 < args.len() {
                    opts.voxels = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--seed" => {
                if i + 1 < args.len() {
                    opts.seed = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--edit-interval" => {
                if i + 1 < args.len() {
                    opts.edit_interval_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"OVS Server - Octree View Stream 서버

뷰 주도 옥트리 스트리밍 서버
- 절차 생성 복셀 장면을 클라이언트 뷰에 맞춰 스트리밍
- 스트림 NACK 재전송 + 편집 인제스트

사용법:
  cargo run --release --bin ovs-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9000)
  -p, --preset <NAME>     설정 프리셋 lan|wan|lossy
  -n, --voxels <N>        장면 복셀 수 (기본: 2000)
  -w, --workers <N>       편집 워커 수 (기본: 2)
  --mtu <BYTES>           최대 패킷 크기 (기본: 1450)
  --rate <PPS>            클라이언트당 초당 패킷 상한 (기본: 600)
  --server-rate <PPS>     서버 전체 초당 패킷 상한 (기본: 6000)
  --no-compress           zstd 압축 비활성화
  --seed <N>              장면 생성 시드 (기본: 42)
  --edit-interval <MS>    장면 교란 주기, 0이면 비활성 (기본: 0)
  -h, --help              이 도움말 출력

예시:
  # WAN 프리셋으로 실행
  cargo run --release --bin ovs-server -- --preset wan

  # 큰 장면 + 100ms마다 복셀 추가/삭제
  cargo run --release --bin ovs-server -- -n 10000 --edit-interval 100
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

/// 절차 생성 데모 장면: 시드 고정 난수로 복셀을 흩뿌린다
fn build_demo_scene(tree: &mut VoxelTree, seed: u64, count: usize) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut placed = 0;
    for _ in 0..count {
        let depth = rng.gen_range(2..=4);
        let path: Vec<u8> = (0..depth).map(|_| rng.gen_range(0..8u8)).collect();
        let color = [rng.gen(), rng.gen(), rng.gen()];
        if tree.set_voxel(&path, color, now_us()).is_ok() {
            placed += 1;
        }
    }
    placed
}

/// 장면 교란 1회: 복셀 하나를 추가하거나 지운다
fn churn_once(tree: &Arc<RwLock<VoxelTree>>, ctx: &Arc<ServerContext>, rng: &mut StdRng) {
    let depth = rng.gen_range(2..=4);
    let path: Vec<u8> = (0..depth).map(|_| rng.gen_range(0..8u8)).collect();
    let stamp = now_us();
    if rng.gen_bool(0.3) {
        let erased = tree.write().erase_voxel(&path, stamp);
        if erased {
            ctx.record_deletion(pack_path(&path), stamp);
        }
    } else {
        let color = [rng.gen(), rng.gen(), rng.gen()];
        let _ = tree.write().set_voxel(&path, color, stamp);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let opts = parse_args();

    info!("OVS Server starting...");
    info!("Bind address: {}", opts.bind_addr);
    info!("Max packet size: {} bytes", opts.config.max_packet_size);
    info!("Compression: {}", opts.config.compress);
    info!(
        "Rate limits: {} pps/client, {} pps total",
        opts.config.client_packets_per_second, opts.config.server_packets_per_second
    );

    // 장면 구성
    let mut tree = VoxelTree::with_default_bounds();
    let placed = build_demo_scene(&mut tree, opts.seed, opts.voxels);
    info!("Demo scene ready: {} voxels (seed {})", placed, opts.seed);

    let tree = Arc::new(RwLock::new(tree));
    let shared: Arc<RwLock<dyn WorldContent>> = tree.clone();

    // 소켓 바인딩
    let socket = Arc::new(UdpSocket::bind(opts.bind_addr).await?);
    info!("Server listening on {}", socket.local_addr()?);

    let (mut server, mut outbound) = Server::start(opts.config.clone(), shared);
    let ctx = server.context();

    // ─────────────────────────────────────────────────────────────────
    // 송신 태스크: 엔진 출력 큐 → UDP
    // ─────────────────────────────────────────────────────────────────
    let send_socket = socket.clone();
    let send_task = tokio::spawn(async move {
        while let Some(datagram) = outbound.recv().await {
            if let Err(error) = send_socket.send_to(&datagram.bytes, datagram.dest).await {
                warn!(%error, dest = %datagram.dest, "UDP 송신 실패");
            }
        }
    });

    // ─────────────────────────────────────────────────────────────────
    // 장면 교란 태스크: 라이브 편집을 흉내 낸다
    // ─────────────────────────────────────────────────────────────────
    if opts.edit_interval_ms > 0 {
        let tree = tree.clone();
        let ctx = ctx.clone();
        let interval_ms = opts.edit_interval_ms;
        let mut rng = StdRng::seed_from_u64(opts.seed.wrapping_add(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                if ctx.is_shutdown() {
                    break;
                }
                churn_once(&tree, &ctx, &mut rng);
            }
        });
        info!("Scene churn enabled: every {} ms", opts.edit_interval_ms);
    }

    // ─────────────────────────────────────────────────────────────────
    // 수신 루프
    // ─────────────────────────────────────────────────────────────────
    let mut buf = vec![0u8; 65535];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                let bytes = Bytes::copy_from_slice(&buf[..len]);
                if let Err(error) = server.handle_datagram(from, bytes) {
                    warn!(%from, %error, "패킷 처리 실패");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    server.shutdown().await;
    info!("{}", ctx.counters.summary(ctx.session_count()));
    send_task.abort();
    Ok(())
}
