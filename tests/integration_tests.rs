//! Integration tests for the session server
//!
//! Each test runs a real server on a loopback port and drives it with
//! websocket clients, the same way browsers and the host screen do.

use futures::{SinkExt, StreamExt};
use mosaic_server::config::{GameTimings, SessionSettings};
use mosaic_server::coordinator::Coordinator;
use mosaic_server::trivia::{Question, QuestionBank};
use mosaic_shared::{Category, Difficulty, Phase, Role};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const HOST_TOKEN: &str = "integration-host";

/// HANDSHAKE AND ADMISSION TESTS
mod handshake_tests {
    use super::*;

    /// Tests that the host endpoint refuses a wrong token before upgrading
    #[tokio::test]
    async fn host_endpoint_rejects_wrong_token() {
        let server = TestServer::start(fast_timings()).await;
        let status = rejected_status(&server.url("/ws/host/wrong")).await;
        assert_eq!(status, 403);
    }

    /// Tests host exclusivity and that the slot frees when the host leaves
    #[tokio::test]
    async fn second_host_rejected_until_first_leaves() {
        let server = TestServer::start(fast_timings()).await;
        let host = TestClient::join(&server, &server.host_path()).await;
        assert_eq!(host.welcome["payload"]["isHost"], true);
        assert_eq!(host.welcome["payload"]["name"], "Host");

        let status = rejected_status(&server.url(&server.host_path())).await;
        assert_eq!(status, 409);

        host.close().await;
        let replacement = timeout(Duration::from_secs(3), async {
            loop {
                if let Ok((socket, _)) = connect_async(server.url(&server.host_path())).await {
                    return socket;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(replacement.is_ok(), "host slot was never freed");
    }

    /// Tests that players cannot join once the game has left setup
    #[tokio::test]
    async fn players_rejected_after_start() {
        let server = TestServer::start(slow_timings()).await;
        let mut lobby = Lobby::fill(&server).await;
        lobby.start().await;

        let status = rejected_status(&server.url("/ws")).await;
        assert_eq!(status, 409);
    }

    /// Tests the status endpoints over plain HTTP
    #[tokio::test]
    async fn health_reports_participants() {
        let server = TestServer::start(fast_timings()).await;
        let _host = TestClient::join(&server, &server.host_path()).await;
        let _player = TestClient::join(&server, "/ws").await;

        let body = http_get(server.addr, "/health").await;
        let health: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["phase"], "setup");
        assert_eq!(health["participants"]["total"], 2);
        assert_eq!(health["participants"]["hasHost"], true);

        let body = http_get(server.addr, "/stats").await;
        let stats: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stats["difficulty"], "medium");
        assert_eq!(stats["totalRounds"], 1);
        assert_eq!(stats["questionCount"], 90);
    }
}

/// RECONNECTION TESTS
mod reconnection_tests {
    use super::*;

    /// Tests that a returning player keeps identity and lobby choices
    #[tokio::test]
    async fn player_resumes_with_same_identity() {
        let server = TestServer::start(fast_timings()).await;
        let mut player = TestClient::join(&server, "/ws").await;
        let id = player.id.clone();

        player
            .send("role_selection", json!({ "role": "detective" }))
            .await;
        player.expect("game_lobby_status").await;
        player.close().await;

        let registry = server.coordinator.orchestrator().registry().clone();
        let disconnected = timeout(Duration::from_secs(2), async {
            while registry.lookup(&id).map(|p| p.is_connected()).unwrap_or(false) {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(disconnected.is_ok());

        let resumed = TestClient::join(&server, &format!("/ws?playerId={}", id)).await;
        assert_eq!(resumed.id, id);
        assert_eq!(resumed.welcome["payload"]["resumed"], true);

        let view = registry.lookup(&id).unwrap().view();
        assert!(view.connected);
        assert_eq!(view.role, Some(Role::Detective));
    }

    /// Tests that an unknown identifier falls back to a fresh registration
    #[tokio::test]
    async fn unknown_identity_registers_fresh() {
        let server = TestServer::start(fast_timings()).await;
        let player = TestClient::join(&server, "/ws?playerId=not-a-player").await;
        assert_ne!(player.id, "not-a-player");
        assert_eq!(player.welcome["payload"]["resumed"], false);
    }

    /// Tests that frames claiming another identity are refused
    #[tokio::test]
    async fn spoofed_identity_gets_error() {
        let server = TestServer::start(fast_timings()).await;
        let mut player = TestClient::join(&server, "/ws").await;

        let frame = json!({
            "type": "player_ready",
            "payload": { "auth": { "playerId": "someone-else" }, "payload": { "ready": true } },
        });
        player
            .socket
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();

        let error = player.expect("error").await;
        assert_eq!(error["payload"]["kind"], "forbidden");
    }
}

/// CONNECTION TEARDOWN TESTS
mod teardown_tests {
    use super::*;

    /// Tests that a session reset closes every open socket
    #[tokio::test]
    async fn reset_closes_connections() {
        let server = TestServer::start(fast_timings()).await;
        let mut player = TestClient::join(&server, "/ws").await;

        let orchestrator = server.coordinator.orchestrator().clone();
        let epoch = orchestrator.epoch().await;
        assert!(orchestrator.reset(epoch).await);
        assert!(orchestrator.registry().is_empty());

        player.expect("game_reset").await;
        assert!(
            closes_within(&mut player.socket, Duration::from_secs(3)).await,
            "socket still open after reset"
        );
    }

    /// Tests that a client silent past the read deadline is suspended and closed
    #[tokio::test]
    async fn silent_client_is_suspended() {
        let timings = GameTimings {
            pong_timeout: Duration::from_millis(300),
            ..fast_timings()
        };
        let server = TestServer::start(timings).await;
        let mut active = TestClient::join(&server, "/ws").await;
        let mut silent = TestClient::join(&server, "/ws").await;
        let registry = server.coordinator.orchestrator().registry().clone();

        // The active client keeps its own deadline fresh while it watches the lobby
        let observed = timeout(Duration::from_secs(3), async {
            loop {
                active.send("player_ready", json!({ "ready": false })).await;
                while let Ok(Some(Ok(frame))) =
                    timeout(Duration::from_millis(50), active.socket.next()).await
                {
                    let Message::Text(text) = frame else {
                        continue;
                    };
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    if value["type"] == "game_lobby_status"
                        && value["payload"]["currentPlayers"] == 1
                    {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(observed.is_ok(), "lobby never reported the silent client gone");

        let record = registry.lookup(&silent.id).unwrap();
        assert!(!record.is_connected());
        assert_eq!(record.connection_id(), None);
        assert!(registry.lookup(&active.id).unwrap().is_connected());
        assert_eq!(registry.len(), 2);

        assert!(closes_within(&mut silent.socket, Duration::from_secs(3)).await);
        assert_eq!(registry.connected().len(), 1);
    }
}

/// FULL GAME FLOW TESTS
mod game_flow_tests {
    use super::*;

    /// Tests a whole game: lobby, trivia, assembly, analytics, reset
    #[tokio::test]
    async fn full_game_with_fast_timings() {
        let server = TestServer::start(fast_timings()).await;
        let mut lobby = Lobby::fill(&server).await;
        lobby.start().await;

        for player in lobby.players.iter_mut() {
            player.expect("resource_phase_start").await;
        }

        // Only the detective answers, so no fragment starts pre-solved
        let detective = &mut lobby.players[1];
        let question = detective.expect("trivia_question").await;
        let question_id = question["payload"]["id"].as_str().unwrap().to_string();
        detective
            .send(
                "trivia_answer",
                json!({ "questionId": question_id, "answer": "Rome", "timestamp": 1 }),
            )
            .await;
        let progress = detective
            .expect_where("team_progress_update", |v| {
                !v["payload"]["lastAnswer"].is_null()
            })
            .await;
        assert_eq!(progress["payload"]["lastAnswer"]["correct"], true);
        assert_eq!(progress["payload"]["lastAnswer"]["tokenType"], "guide");

        let mut segments = Vec::new();
        for player in lobby.players.iter_mut() {
            let load = player.expect("puzzle_phase_load").await;
            assert_eq!(load["payload"]["gridSize"], 3);
            assert_eq!(load["payload"]["preSolved"], false);
            segments.push(load["payload"]["segmentId"].as_str().unwrap().to_string());
            player.expect("guide_highlight").await;
        }
        assert!(segments.iter().all(|s| s.starts_with("segment_")));

        lobby.host.send("host_start_puzzle", json!({})).await;
        let start = lobby.host.expect("puzzle_phase_start").await;
        assert_eq!(start["payload"]["totalTime"], 300);

        for (player, segment) in lobby.players.iter_mut().zip(&segments) {
            player
                .send(
                    "segment_completed",
                    json!({ "segmentId": segment, "completionTimestamp": 1 }),
                )
                .await;
            let ack = player.expect("segment_completion_ack").await;
            assert_eq!(ack["payload"]["status"], "acknowledged");
        }

        for player in lobby.players.iter_mut() {
            let analytics = player.expect("game_analytics").await;
            assert_eq!(analytics["payload"]["team"]["success"], true);
            assert_eq!(analytics["payload"]["leaderboard"].as_array().unwrap().len(), 4);
        }
        let summary = lobby.host.expect("game_analytics").await;
        assert_eq!(summary["payload"]["outcome"], "solved");

        lobby.host.expect("game_reset").await;
        let orchestrator = server.coordinator.orchestrator().clone();
        let reset = timeout(Duration::from_secs(2), async {
            while orchestrator.phase().await != Phase::Setup || !orchestrator.registry().is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reset.is_ok(), "session was not reset");
    }

    /// Tests that moves are rejected before assembly with a phase error
    #[tokio::test]
    async fn fragment_move_outside_assembly_is_rejected() {
        let server = TestServer::start(fast_timings()).await;
        let mut player = TestClient::join(&server, "/ws").await;

        player
            .send(
                "fragment_move_request",
                json!({ "fragmentId": "fragment_x", "newPosition": { "x": 0, "y": 0 } }),
            )
            .await;
        let error = player.expect("error").await;
        assert_eq!(error["payload"]["kind"], "phase_mismatch");
    }

    /// Tests that the host cannot start an under-filled lobby
    #[tokio::test]
    async fn start_requires_full_lobby() {
        let server = TestServer::start(fast_timings()).await;
        let mut host = TestClient::join(&server, &server.host_path()).await;
        let _player = TestClient::join(&server, "/ws").await;

        host.send("host_start_game", json!({})).await;
        let error = host.expect("error").await;
        assert_eq!(error["payload"]["kind"], "not_eligible");
    }
}

// HELPER FUNCTIONS

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    coordinator: Arc<Coordinator>,
    addr: SocketAddr,
}

impl TestServer {
    async fn start(timings: GameTimings) -> Self {
        let settings = SessionSettings {
            timings,
            min_players: 4,
            max_players: 8,
            default_difficulty: Difficulty::Medium,
        };
        let coordinator = Arc::new(Coordinator::new(
            settings,
            Arc::new(question_bank()),
            HOST_TOKEN.to_string(),
            Vec::new(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = Arc::clone(&coordinator);
        tokio::spawn(async move { serving.serve(listener).await });

        Self { coordinator, addr }
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    fn host_path(&self) -> String {
        format!("/ws/host/{}", HOST_TOKEN)
    }
}

struct TestClient {
    socket: Socket,
    id: String,
    welcome: Value,
}

impl TestClient {
    async fn join(server: &TestServer, path: &str) -> Self {
        let (mut socket, _) = connect_async(server.url(path)).await.unwrap();
        let welcome = expect_message(&mut socket, "available_roles", |_| true).await;
        let id = welcome["payload"]["playerId"].as_str().unwrap().to_string();
        Self {
            socket,
            id,
            welcome,
        }
    }

    async fn send(&mut self, kind: &str, payload: Value) {
        let frame = json!({
            "type": kind,
            "payload": { "auth": { "playerId": self.id }, "payload": payload },
        });
        self.socket
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    async fn expect(&mut self, kind: &str) -> Value {
        expect_message(&mut self.socket, kind, |_| true).await
    }

    async fn expect_where(&mut self, kind: &str, accept: impl Fn(&Value) -> bool) -> Value {
        expect_message(&mut self.socket, kind, accept).await
    }

    async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

/// Host plus four players, each with a distinct role and a specialty.
struct Lobby {
    host: TestClient,
    players: Vec<TestClient>,
}

impl Lobby {
    async fn fill(server: &TestServer) -> Self {
        let host = TestClient::join(server, &server.host_path()).await;
        let mut players = Vec::new();
        for role in Role::ALL {
            let mut player = TestClient::join(server, "/ws").await;
            player
                .send("role_selection", json!({ "role": role.as_str() }))
                .await;
            player
                .send(
                    "trivia_specialty_selection",
                    json!({ "specialties": ["history"] }),
                )
                .await;
            player
                .send(
                    "resource_location_verified",
                    json!({ "verifiedHash": role.bonus_token().station_hash() }),
                )
                .await;
            players.push(player);
        }
        Self { host, players }
    }

    async fn start(&mut self) {
        self.host
            .expect_where("game_lobby_status", |v| v["payload"]["canStart"] == true)
            .await;
        self.host.send("host_start_game", json!({})).await;
        self.host
            .expect_where("host_update", |v| v["payload"]["phase"] == "resource_gathering")
            .await;
    }
}

async fn expect_message(
    socket: &mut Socket,
    kind: &str,
    accept: impl Fn(&Value) -> bool,
) -> Value {
    let found = timeout(Duration::from_secs(5), async {
        while let Some(frame) = socket.next().await {
            let Ok(Message::Text(text)) = frame else {
                continue;
            };
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == kind && accept(&value) {
                return Some(value);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(value)) => value,
        Ok(None) => panic!("connection closed before {}", kind),
        Err(_) => panic!("timed out waiting for {}", kind),
    }
}

/// True once the server ends the stream, ignoring frames queued before that.
async fn closes_within(socket: &mut Socket, limit: Duration) -> bool {
    timeout(limit, async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .is_ok()
}

async fn rejected_status(url: &str) -> u16 {
    match connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected handshake error: {}", e),
        Ok(_) => panic!("handshake to {} was accepted", url),
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default()
}

fn question_bank() -> QuestionBank {
    QuestionBank::from_questions((0..30).flat_map(|i| {
        [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard]
            .into_iter()
            .map(move |difficulty| Question {
                id: format!("q{}-{}", i, difficulty),
                text: "Which city was the capital of the Roman Empire?".to_string(),
                category: Category::History,
                difficulty,
                time_limit: 30,
                options: vec!["Rome".into(), "Athens".into(), "Carthage".into()],
                is_specialty: false,
                correct_answer: "Rome".to_string(),
            })
    }))
}

fn fast_timings() -> GameTimings {
    GameTimings {
        rounds: 1,
        round_duration: Duration::from_millis(1500),
        question_interval: Duration::from_millis(1500),
        assembly_base: Duration::from_secs(300),
        progress_tick: Duration::from_millis(200),
        post_game_display: Duration::from_millis(200),
        move_cooldown: Duration::from_millis(100),
        ping_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(60),
    }
}

fn slow_timings() -> GameTimings {
    GameTimings {
        round_duration: Duration::from_secs(60),
        question_interval: Duration::from_secs(60),
        ..fast_timings()
    }
}
