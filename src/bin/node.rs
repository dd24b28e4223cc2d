//! GPC 노드 - Group Peer Coordination
//!
//! 하나의 프로세스가 클라이언트로 동작하고, 선출되면 서버 역할도 맡음
//!
//! 사용법:
//!   cargo run --release --bin gpc-node -- [OPTIONS]
//!
//! 예시:
//!   # 서버 역할로 시작
//!   cargo run --release --bin gpc-node -- --server
//!
//!   # 클라이언트로 참가
//!   cargo run --release --bin gpc-node -- --port 127.0.0.1:1200 --id 42

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gpc::election::listen_multicast;
use gpc::message::FileChunkKind;
use gpc::{
    connect, ClientEvent, ClientHandle, Config, ElectionCoordinator, Error, FileChunk,
    LogicalClock, Message, NodeId, RoleController, Transport,
};

/// 노드 실행 설정
struct NodeConfig {
    start_server: bool,
    node_id: NodeId,
    config: Config,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            start_server: false,
            node_id: std::process::id() as NodeId,
            config: Config::default(),
        }
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> T {
    match value.map(|v| v.parse()) {
        Some(Ok(parsed)) => parsed,
        _ => {
            eprintln!("{} 값이 올바르지 않음", flag);
            std::process::exit(2);
        }
    }
}

fn parse_args() -> NodeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut node = NodeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                node.config.server_addr = parse_value(&args[i], args.get(i + 1));
                i += 1;
            }
            "--server" | "-s" => {
                node.start_server = true;
            }
            "--id" => {
                node.node_id = parse_value(&args[i], args.get(i + 1));
                i += 1;
            }
            "--multicast" => {
                node.config.multicast_group = parse_value(&args[i], args.get(i + 1));
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"GPC Node - Group Peer Coordination

UDP 위의 신뢰성 전달, 서버 선출, 시계 동기화

사용법:
  cargo run --release --bin gpc-node -- [OPTIONS]

옵션:
  -p, --port <ADDR>       서버 주소 (기본: 127.0.0.1:1200)
  -s, --server            시작할 때 서버 역할도 실행
  --id <N>                선거용 노드 ID (기본: 프로세스 ID)
  --multicast <ADDR>      선거용 멀티캐스트 그룹 (기본: 224.0.1.60:1888)
  -h, --help              이 도움말 출력

명령:
  /nick <NAME>            닉네임 등록
  /names                  접속 중인 사용자
  /msg <NAME> <TEXT>      개인 메시지
  /send <NAME> <PATH>     파일 전송
  /block <NAME>           사용자 차단
  /admin start|stop       서버 역할 시작/중지
  /quit                   종료
  그 외 입력              전체 메시지
"#
                );
                std::process::exit(0);
            }
            other => {
                warn!("알 수 없는 옵션 무시: {}", other);
            }
        }
        i += 1;
    }

    node
}

/// 수신 중인 파일
struct IncomingFile {
    name: PathBuf,
    file: File,
}

async fn handle_file_chunk(chunk: FileChunk, incoming: &mut Option<IncomingFile>) -> std::io::Result<()> {
    match chunk.kind {
        FileChunkKind::Start => {
            let name = PathBuf::from(&chunk.filename)
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("received.bin"));
            let file = File::create(&name).await?;
            println!("[{}] 파일 수신 시작: {}", chunk.from, name.display());
            *incoming = Some(IncomingFile { name, file });
        }
        FileChunkKind::Mid => match incoming {
            Some(current) => current.file.write_all(&chunk.content).await?,
            None => warn!("시작 조각 없이 파일 데이터 수신: {}", chunk.filename),
        },
        FileChunkKind::End => {
            if let Some(mut current) = incoming.take() {
                current.file.flush().await?;
                println!("[{}] 파일 수신 완료: {}", chunk.from, current.name.display());
            }
        }
    }
    Ok(())
}

async fn send_file(client: &ClientHandle, to: &str, path: &str) -> gpc::Result<()> {
    let content = tokio::fs::read(path).await?;
    let chunks = FileChunk::split(to, path, &content);
    info!("파일 전송: {} → {} ({}바이트, {}조각)", path, to, content.len(), chunks.len());

    for chunk in chunks {
        client.send(&Message::FileChunk(chunk)).await?;
    }
    Ok(())
}

/// 입력 한 줄 처리, 종료 요청이면 `false`
async fn handle_command(
    line: &str,
    client: &ClientHandle,
    role: &gpc::RoleHandle,
    config: &Config,
    node_id: NodeId,
    nickname: &mut Option<String>,
) -> gpc::Result<bool> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(true);
    }

    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();

    match command {
        "/nick" => match parts.next() {
            Some(name) => {
                *nickname = Some(name.to_string());
                client
                    .send(&Message::Login {
                        nickname: name.to_string(),
                        node_id,
                    })
                    .await?;
            }
            None => println!("사용법: /nick <NAME>"),
        },
        "/names" => client.send(&Message::GetConnected { users: Vec::new() }).await?,
        "/msg" => match (parts.next(), parts.next()) {
            (Some(to), Some(text)) => {
                client
                    .send(&Message::DirectMessage {
                        from: String::new(),
                        to: to.to_string(),
                        message: text.to_string(),
                    })
                    .await?
            }
            _ => println!("사용법: /msg <NAME> <TEXT>"),
        },
        "/send" => match (parts.next(), parts.next()) {
            (Some(to), Some(path)) => {
                if let Err(e) = send_file(client, to, path).await {
                    println!("파일 전송 실패: {}", e);
                }
            }
            _ => println!("사용법: /send <NAME> <PATH>"),
        },
        "/block" => match (parts.next(), nickname.as_deref()) {
            (Some(blocked), Some(me)) => {
                client
                    .send(&Message::Block {
                        blocker: me.to_string(),
                        blocked: blocked.to_string(),
                    })
                    .await?
            }
            (None, _) => println!("사용법: /block <NAME>"),
            (_, None) => println!("먼저 /nick 으로 등록하세요"),
        },
        "/admin" => match parts.next() {
            Some("start") => {
                if !role.request_start(config.server_addr)? {
                    println!("이미 시작 요청이 대기 중");
                }
            }
            Some("stop") => {
                if !role.request_stop()? {
                    println!("이미 중지 요청이 대기 중");
                }
            }
            _ => println!("사용법: /admin start|stop"),
        },
        "/quit" => {
            client.send(&Message::Exit).await?;
            return Ok(false);
        }
        _ => {
            client
                .send(&Message::Broadcast {
                    from: String::new(),
                    message: line.to_string(),
                })
                .await?
        }
    }

    Ok(true)
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::LoggedIn { node_id } => println!("등록 완료 (node_id={})", node_id),
        ClientEvent::Broadcast { from, message } => println!("[{}] {}", from, message),
        ClientEvent::Direct { from, message } => println!("[{} → 나] {}", from, message),
        ClientEvent::Connected(users) => println!("접속 중: {}", users.join(", ")),
        ClientEvent::ServerError(message) => println!("서버 에러: {}", message),
        ClientEvent::ClockCorrected { adjustment_us, .. } => {
            info!("시계 보정: {}us", adjustment_us)
        }
        ClientEvent::File(_) => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG, 기본 info)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let node = parse_args();
    let config = node.config.clone();

    info!("GPC Node starting...");
    info!("Node id: {}", node.node_id);
    info!("Server address: {}", config.server_addr);
    info!("Multicast group: {}", config.multicast_group);

    // 역할 제어기
    let (controller, role) = RoleController::new(config.clone());
    let mut controller_task = tokio::spawn(controller.run());
    if node.start_server {
        role.request_start(config.server_addr)?;
    }

    // 선거: 송신 소켓 하나, 그룹 수신 소켓 하나
    let multicast_writer =
        Arc::new(Transport::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?);
    let (coordinator, election) =
        ElectionCoordinator::new(node.node_id, multicast_writer.clone(), &config, role.clone());
    tokio::spawn(coordinator.run());

    let _multicast_listener = match Transport::bind_multicast(config.multicast_group) {
        Ok(listener) => {
            let stream = listener.listen(config.recv_buffer_size, config.channel_capacity)?;
            listen_multicast(stream, election.clone());
            Some(listener)
        }
        Err(e) => {
            warn!("멀티캐스트 그룹 참가 실패, 다른 노드의 투표를 받지 못함: {}", e);
            None
        }
    };

    // 클라이언트
    let mut session = connect(&config, election.clone(), LogicalClock::from_wall_clock()).await?;
    info!("Client bound to {}", session.local_addr());
    println!("닉네임을 등록하세요: /nick <NAME>  (도움말: --help)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut nickname: Option<String> = None;
    let mut incoming: Option<IncomingFile> = None;

    let exit_code = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    match handle_command(&line, &session.handle, &role, &config, node.node_id, &mut nickname).await {
                        Ok(true) => {}
                        Ok(false) => break 0,
                        Err(e) => {
                            error!("명령 처리 실패: {}", e);
                            if e.is_fatal() || matches!(e, Error::ChannelError) {
                                break 1;
                            }
                        }
                    }
                }
                Ok(None) => break 0,
                Err(e) => {
                    error!("입력 읽기 실패: {}", e);
                    break 1;
                }
            },

            event = session.events.recv() => match event {
                Some(ClientEvent::File(chunk)) => {
                    if let Err(e) = handle_file_chunk(chunk, &mut incoming).await {
                        warn!("파일 쓰기 실패: {}", e);
                    }
                }
                Some(event) => print_event(&event),
                None => break 1,
            },

            result = &mut controller_task => {
                match result {
                    Ok(Err(e @ Error::ServerShutdownFault { .. })) => error!("치명적 에러: {}", e),
                    Ok(Err(e)) => error!("역할 제어기 종료: {}", e),
                    Ok(Ok(())) => error!("역할 제어기가 예기치 않게 종료됨"),
                    Err(e) => error!("역할 제어기 태스크 실패: {}", e),
                }
                break 1;
            }
        }
    };

    // 잠깐 기다려 마지막 메시지(Exit)가 나가도록 함
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Err(e) = session.shutdown(config.confirmation_timeout).await {
        warn!("클라이언트 소켓 닫기 실패: {}", e);
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
