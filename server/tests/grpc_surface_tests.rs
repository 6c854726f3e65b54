//! Drives the real gRPC surface: a tonic server on an ephemeral port, real
//! clients, streamed status frames. The store and bridge are in-memory.

use std::sync::Arc;
use std::time::Duration;

use ::common::modes;
use server::config::HandlerConfig;
use server::handler::LobbyHandler;
use server::lobbyv1::lobby_service_client::LobbyServiceClient;
use server::lobbyv1::lobby_service_server::LobbyServiceServer;
use server::lobbyv1::{JoinLobbyRequest, LobbyStatus, Status as StatusCode};
use server::matcher::{Matcher, MatcherConfig};
use server::waiter::Waiter;
use server::streamer::StreamManager;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Server};

mod common;
use self::common::{LoopbackBridge, MemoryStore, fast_waiter_config};

async fn spawn_server() -> (LobbyServiceClient<Channel>, CancellationToken) {
    let store = Arc::new(MemoryStore::new());
    let bridge = Arc::new(LoopbackBridge::new());

    let streamer = StreamManager::new(bridge);
    let matcher = Arc::new(Matcher::new(MatcherConfig::default()));
    let waiter = Arc::new(Waiter::new(
        store.clone(),
        streamer.clone(),
        fast_waiter_config(),
    ));
    let shutdown = CancellationToken::new();

    let handler = LobbyHandler::new(
        store,
        streamer,
        matcher,
        waiter,
        HandlerConfig::default(),
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    let server_token = shutdown.clone();
    tokio::spawn(async move {
        Server::builder()
            .add_service(LobbyServiceServer::new(handler))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                server_token.cancelled().await
            })
            .await
            .expect("grpc server");
    });

    let mut client = None;
    for _ in 0..20 {
        match LobbyServiceClient::connect(format!("http://{addr}")).await {
            Ok(c) => {
                client = Some(c);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }

    (client.expect("client should connect"), shutdown)
}

async fn read_terminal(stream: &mut tonic::codec::Streaming<LobbyStatus>) -> LobbyStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = tokio::time::timeout(remaining, stream.message())
            .await
            .expect("frame within budget")
            .expect("stream healthy")
            .expect("stream should not end before a terminal frame");

        if server::streamer::is_terminal(&frame) {
            return frame;
        }
    }
}

#[tokio::test]
async fn duel_pair_starts_over_the_wire() {
    let (mut client, shutdown) = spawn_server().await;

    let mut s1 = client
        .join_lobby(JoinLobbyRequest {
            player_id: "wire-p1".to_string(),
            rating: 1000,
            category_ids: vec![1, 2],
            mode: modes::DUEL.to_string(),
        })
        .await
        .expect("first join accepted")
        .into_inner();

    let first = tokio::time::timeout(Duration::from_secs(3), s1.message())
        .await
        .expect("frame within budget")
        .expect("stream healthy")
        .expect("waiting frame");
    assert_eq!(first.status, StatusCode::Waiting as i32);
    assert_eq!(first.max_players, 2);

    let mut s2 = client
        .join_lobby(JoinLobbyRequest {
            player_id: "wire-p2".to_string(),
            rating: 1020,
            category_ids: vec![1, 2],
            mode: modes::DUEL.to_string(),
        })
        .await
        .expect("second join accepted")
        .into_inner();

    let f1 = read_terminal(&mut s1).await;
    let f2 = read_terminal(&mut s2).await;

    assert_eq!(f1.status, StatusCode::Starting as i32);
    assert_eq!(f2.status, StatusCode::Starting as i32);
    assert_eq!(f1.lobby_id, f2.lobby_id);
    assert_eq!(f1.current_players, 2);
    assert_eq!(f1.game_id, "");

    shutdown.cancel();
}

#[tokio::test]
async fn join_without_player_id_is_rejected() {
    let (mut client, shutdown) = spawn_server().await;

    let err = client
        .join_lobby(JoinLobbyRequest {
            player_id: String::new(),
            rating: 1000,
            category_ids: vec![],
            mode: modes::CLASSIC.to_string(),
        })
        .await
        .expect_err("empty player_id must be rejected");

    assert_eq!(err.code(), tonic::Code::InvalidArgument);

    shutdown.cancel();
}
