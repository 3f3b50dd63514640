//! Integration tests for the multi-transport inbox and dispatcher.
//!
//! These spin up the real server wiring on ephemeral localhost ports and
//! drive it with real TCP, UDP and WebSocket clients.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use arena_server::connection::{TcpConnection, UdpConnection, WsConnection};
use arena_server::db::Database;
use arena_server::dispatcher::Dispatcher;
use arena_server::inbox::Inbox;
use arena_server::options::MatchOptions;
use arena_server::queue::Queue;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    ws_addr: SocketAddr,
}

/// Wire up inbox, dispatcher and all three listeners like `main` does.
async fn start_server(options: MatchOptions) -> TestServer {
    let options = Arc::new(options);
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let inbox = Arc::new(Inbox::new(msg_tx));
    let queue = Arc::new(Mutex::new(Queue::new()));
    let db = Database::open(":memory:").unwrap();

    let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let udp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = TestServer {
        tcp_addr: tcp_listener.local_addr().unwrap(),
        udp_addr: udp_socket.local_addr().unwrap(),
        ws_addr: ws_listener.local_addr().unwrap(),
    };

    {
        let inbox = inbox.clone();
        let options = options.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = tcp_listener.accept().await else { break };
                let conn = Arc::new(TcpConnection::new(stream, options.clone()));
                let inbox = inbox.clone();
                tokio::spawn(async move { inbox.listen(conn).await });
            }
        });
    }
    {
        let inbox = inbox.clone();
        tokio::spawn(async move {
            inbox.listen(Arc::new(UdpConnection::new(udp_socket))).await;
        });
    }
    {
        let inbox = inbox.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = ws_listener.accept().await else { break };
                let inbox = inbox.clone();
                tokio::spawn(async move {
                    if let Ok(conn) = WsConnection::handshake(stream).await {
                        inbox.listen(Arc::new(conn)).await;
                    }
                });
            }
        });
    }

    tokio::spawn(
        Dispatcher::new(inbox, queue, db, options, msg_rx, event_tx, event_rx).run(),
    );
    server
}

/// Connect a WebSocket client and identify it with `init`.
async fn ws_client(addr: SocketAddr, type_code: u64, id: &str) -> WsClient {
    let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    let init = json!({"cmd": "init", "TYPE": type_code, "ID": id});
    ws.send(Message::Text(init.to_string())).await.unwrap();
    ws
}

/// Read frames until one carries the wanted `cmd`, skipping everything else.
async fn next_cmd(ws: &mut WsClient, want: &str) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let v: Value = serde_json::from_str(&text).unwrap();
                    if v["cmd"] == want {
                        return v;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("ws stream ended early: {:?}", other),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", want))
}

fn controller_ids(controller_data: &Value) -> Vec<String> {
    controller_data["data"]
        .as_array()
        .expect("ControllerData carries a list")
        .iter()
        .map(|c| c["id"].as_str().unwrap().to_string())
        .collect()
}

mod connection_lifecycle {
    use super::*;

    #[tokio::test]
    async fn simulator_join_and_leave_reach_the_admin() {
        let server = start_server(MatchOptions::default()).await;

        let mut admin = ws_client(server.ws_addr, 1, "a1").await;
        next_cmd(&mut admin, "init").await;

        let sim = ws_client(server.ws_addr, 2, "s1").await;
        let joined = next_cmd(&mut admin, "ControllerData").await;
        assert_eq!(controller_ids(&joined), vec!["2:s1"]);

        // dropping the socket is how devices leave
        drop(sim);
        let left = next_cmd(&mut admin, "ControllerData").await;
        assert!(controller_ids(&left).is_empty());
    }

    #[tokio::test]
    async fn ws_reinit_rebinds_identity_without_remnant() {
        let server = start_server(MatchOptions::default()).await;

        let mut admin = ws_client(server.ws_addr, 1, "a1").await;
        next_cmd(&mut admin, "init").await;

        let mut sim = ws_client(server.ws_addr, 2, "s1").await;
        let joined = next_cmd(&mut admin, "ControllerData").await;
        assert_eq!(controller_ids(&joined), vec!["2:s1"]);

        // a second init with a new id replaces the old identity
        sim.send(Message::Text(
            json!({"cmd": "init", "TYPE": 2, "ID": "s2"}).to_string(),
        ))
        .await
        .unwrap();
        let rebound = next_cmd(&mut admin, "ControllerData").await;
        assert_eq!(controller_ids(&rebound), vec!["2:s2"]);

        // so does a changed type under the same id
        sim.send(Message::Text(
            json!({"cmd": "init", "TYPE": 5, "ID": "s2"}).to_string(),
        ))
        .await
        .unwrap();
        let retyped = next_cmd(&mut admin, "ControllerData").await;
        assert_eq!(controller_ids(&retyped), vec!["5:s2"]);
    }

    #[tokio::test]
    async fn wearable_datagram_registers_and_gets_pinged() {
        let server = start_server(MatchOptions::default()).await;

        let mut admin = ws_client(server.ws_addr, 1, "a1").await;
        next_cmd(&mut admin, "init").await;

        let wearable = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        wearable.send_to(b"ABCxyzLLLss", server.udp_addr).await.unwrap();

        let joined = next_cmd(&mut admin, "ControllerData").await;
        assert_eq!(controller_ids(&joined), vec!["5:xyz"]);

        // the liveness loop sends a calibration ping right away
        let mut buf = [0u8; 32];
        let (n, _) = timeout(Duration::from_secs(5), wearable.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"CALxyz00");
    }
}

mod arduino_path {
    use super::*;

    async fn read_tcp_until(stream: &mut TcpStream, needle: &str) -> String {
        use tokio::io::AsyncReadExt;
        timeout(Duration::from_secs(5), async {
            let mut seen = String::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "tcp stream closed while waiting for {}", needle);
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
                if seen.contains(needle) {
                    return seen;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", needle))
    }

    #[tokio::test]
    async fn configured_wall_gets_score_then_loopback_traffic() {
        let server = start_server(MatchOptions {
            main_arduino: vec!["A01".into()],
            ..MatchOptions::default()
        })
        .await;

        let mut wall = TcpStream::connect(server.tcp_addr).await.unwrap();
        wall.write_all(b"<[ID]A01[SC]1>").await.unwrap();

        // coming online with an unconfirmed score triggers the push
        let seen = read_tcp_until(&mut wall, "init_score").await;
        assert!(seen.contains("\"T1\""));

        // a test device's messages are fanned out to every wall
        let mut tester = ws_client(server.ws_addr, 3, "t1").await;
        tester
            .send(Message::Text(json!({"cmd": "blink"}).to_string()))
            .await
            .unwrap();
        let seen = read_tcp_until(&mut wall, "blink").await;
        assert!(seen.contains("<{"));
    }

    #[tokio::test]
    async fn mode_change_reaches_the_wall_stringified() {
        let server = start_server(MatchOptions {
            main_arduino: vec!["A01".into()],
            ..MatchOptions::default()
        })
        .await;

        let mut wall = TcpStream::connect(server.tcp_addr).await.unwrap();
        wall.write_all(b"<[ID]A01>").await.unwrap();
        read_tcp_until(&mut wall, "init_score").await;

        let mut admin = ws_client(server.ws_addr, 1, "a1").await;
        admin
            .send(Message::Text(
                json!({"cmd": "arduinoModeChange", "mode": 2}).to_string(),
            ))
            .await
            .unwrap();

        let seen = read_tcp_until(&mut wall, "mode_change").await;
        assert!(seen.contains("\"mode\":\"2\""));
    }
}

mod match_lifecycle {
    use super::*;

    #[tokio::test]
    async fn team_start_runs_a_match_until_stopped() {
        let server = start_server(MatchOptions {
            warmup: 0.0,
            mode1_total_time: 3600.0,
            ..MatchOptions::default()
        })
        .await;

        let mut admin = ws_client(server.ws_addr, 1, "a1").await;
        next_cmd(&mut admin, "init").await;
        let mut sim = ws_client(server.ws_addr, 2, "s1").await;
        next_cmd(&mut admin, "ControllerData").await;

        admin
            .send(Message::Text(
                json!({
                    "cmd": "teamStart",
                    "teamID": "2001",
                    "mode": "m1",
                    "ids": "2:s1",
                })
                .to_string(),
            ))
            .await
            .unwrap();

        let started = next_cmd(&mut admin, "newMatch").await;
        let mid = started["data"].as_u64().unwrap();
        assert!(mid > 0);
        assert_eq!(next_cmd(&mut sim, "newMatch").await["data"].as_u64(), Some(mid));

        // updates flow once per second to both sides
        let update = next_cmd(&mut sim, "updateMatch").await;
        assert_eq!(update["data"]["matchID"].as_u64(), Some(mid));

        sim.send(Message::Text(
            json!({"cmd": "stopMatch", "matchID": mid}).to_string(),
        ))
        .await
        .unwrap();

        let stopped = next_cmd(&mut admin, "matchStop").await;
        assert_eq!(stopped["data"].as_u64(), Some(mid));
    }

    #[tokio::test]
    async fn simulator_init_echoes_options_and_id() {
        let server = start_server(MatchOptions::default()).await;

        let mut sim = ws_client(server.ws_addr, 2, "s1").await;
        let reply = next_cmd(&mut sim, "init").await;
        assert_eq!(reply["data"]["ID"], "s1");
        assert_eq!(reply["data"]["options"]["arena_width"].as_u64(), Some(5));
    }
}
