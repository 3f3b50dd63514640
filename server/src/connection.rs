//! Transport implementations behind the inbox.
//!
//! Three kinds of device speak three different framings:
//!
//! - wall arduinos: TCP, frames delimited by `<` and `>`, carrying either a
//!   JSON object or a bracketed heartbeat,
//! - wearables: UDP, fixed 11-byte records plus a liveness ping loop,
//! - tablets and simulators: WebSocket, one JSON object per text frame.
//!
//! All three satisfy [`InboxConnection`]: read one logical message (stamping
//! routing annotations), write one message, answer whether an address query
//! matches, close. A connection holds at most one identity at a time;
//! claiming a new one releases the old in the same message.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arena_shared::{InboxAddress, InboxAddressType, InboxMessage};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::options::MatchOptions;

/// How long a wearable may stay silent after a ping before it is dropped.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between acknowledged pings.
const PING_INTERVAL: Duration = Duration::from_secs(3);
/// Fixed wearable record length: head(3) id(3) loc(3) status(2).
const WEARABLE_RECORD_LEN: usize = 11;

/// Contract every transport satisfies.
///
/// `read` blocks until one logical message is framed and stamps the routing
/// annotations. On end-of-stream or error it stamps `should_close_connection`
/// (and the released identity) before returning the error; the inbox still
/// forwards that final message so the dispatcher observes the departure.
#[async_trait]
pub trait InboxConnection: Send + Sync {
    async fn read(&self, msg: &mut InboxMessage) -> io::Result<()>;
    async fn write(&self, msg: &InboxMessage) -> io::Result<()>;
    /// Does this connection currently carry `addr`? Pure, no I/O.
    fn accept(&self, addr: &InboxAddress) -> bool;
    async fn close(&self) -> io::Result<()>;
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")
}

// ---------------------------------------------------------------------------
// TCP (wall arduinos)
// ---------------------------------------------------------------------------

pub struct TcpConnection {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    identity: RwLock<Option<InboxAddress>>,
    options: Arc<MatchOptions>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, options: Arc<MatchOptions>) -> Self {
        let (read_half, write_half) = stream.into_split();
        TcpConnection {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            identity: RwLock::new(None),
            options,
        }
    }

    fn stamp_close(&self, msg: &mut InboxMessage) {
        msg.should_close_connection = true;
        if let Some(addr) = self.identity.read().unwrap().clone() {
            msg.remove_address = Some(addr);
        }
    }

    /// Heartbeats carry the device id; a changed id rebinds this connection.
    fn apply_heartbeat_identity(&self, msg: &mut InboxMessage) {
        let id = msg.get_str("ID").to_string();
        if id.is_empty() {
            return;
        }
        let old = self.identity.read().unwrap().clone();
        if old.as_ref().map(|a| a.id.as_str()) == Some(id.as_str()) {
            return;
        }
        let addr = InboxAddress::new(self.options.arduino_kind(&id), &id);
        msg.add_address = Some(addr.clone());
        msg.address = Some(addr.clone());
        if let Some(old) = old {
            msg.remove_address = Some(old);
        }
        *self.identity.write().unwrap() = Some(addr);
    }
}

#[async_trait]
impl InboxConnection for TcpConnection {
    async fn read(&self, msg: &mut InboxMessage) -> io::Result<()> {
        let mut reader = self.reader.lock().await;

        // Consume up to and including the frame opener.
        let mut skipped = Vec::new();
        match reader.read_until(b'<', &mut skipped).await {
            Ok(_) if skipped.last() == Some(&b'<') => {}
            Ok(_) => {
                self.stamp_close(msg);
                return Err(eof());
            }
            Err(e) => {
                self.stamp_close(msg);
                return Err(e);
            }
        }

        // Payload runs up to and including the closer.
        let mut payload = Vec::new();
        match reader.read_until(b'>', &mut payload).await {
            Ok(_) if payload.last() == Some(&b'>') => {}
            Ok(_) => {
                self.stamp_close(msg);
                return Err(eof());
            }
            Err(e) => {
                self.stamp_close(msg);
                return Err(e);
            }
        }
        payload.pop();

        if let Some(addr) = self.identity.read().unwrap().clone() {
            msg.address = Some(addr);
        }
        if payload.is_empty() {
            return Ok(());
        }

        if payload[0] == b'{' {
            match serde_json::from_slice::<Value>(&payload) {
                Ok(Value::Object(map)) => msg.data = map,
                _ => debug!("dropping malformed tcp json frame"),
            }
        } else {
            parse_heartbeat(&String::from_utf8_lossy(&payload), msg);
            msg.set_cmd("hb");
            self.apply_heartbeat_identity(msg);
        }
        Ok(())
    }

    async fn write(&self, msg: &InboxMessage) -> io::Result<()> {
        let body = msg
            .marshal()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut frame = Vec::with_capacity(body.len() + 2);
        frame.push(b'<');
        frame.extend_from_slice(body.as_bytes());
        frame.push(b'>');

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await
    }

    fn accept(&self, addr: &InboxAddress) -> bool {
        match self.identity.read().unwrap().as_ref() {
            Some(current) => {
                current.kind == addr.kind && (addr.is_wildcard() || addr.id == current.id)
            }
            None => false,
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

/// Heartbeat frames are `[key1]value1[key2]value2...`.
fn parse_heartbeat(text: &str, msg: &mut InboxMessage) {
    for segment in text.split('[') {
        let mut kv = segment.splitn(2, ']');
        if let (Some(key), Some(value)) = (kv.next(), kv.next()) {
            if !key.is_empty() {
                msg.set(key, value);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UDP (wearables)
// ---------------------------------------------------------------------------

struct WearableClient {
    addr: SocketAddr,
    live_tx: mpsc::Sender<()>,
}

/// One UDP socket serves every wearable; the connection keeps a table of
/// the ids it has seen and pings each one from its own task.
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<HashMap<String, WearableClient>>>,
    remove_tx: mpsc::UnboundedSender<String>,
    remove_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl UdpConnection {
    pub fn new(socket: UdpSocket) -> Self {
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        UdpConnection {
            socket: Arc::new(socket),
            clients: Arc::new(RwLock::new(HashMap::new())),
            remove_tx,
            remove_rx: Mutex::new(remove_rx),
        }
    }

    fn handle_record(&self, record: &[u8], peer: SocketAddr, msg: &mut InboxMessage) {
        let Ok(text) = std::str::from_utf8(record) else {
            debug!("dropping non-utf8 wearable record from {}", peer);
            return;
        };
        let (head, rest) = text.split_at(3);
        let (id, rest) = rest.split_at(3);
        let (loc, status) = rest.split_at(3);
        msg.set("head", head);
        msg.set("loc", loc);
        msg.set("status", status);

        let known = self.clients.read().unwrap().contains_key(id);
        if known {
            msg.address = Some(InboxAddress::new(InboxAddressType::Wearable, id));
            if let Some(client) = self.clients.read().unwrap().get(id) {
                // Lossy on purpose: one pending signal is enough.
                let _ = client.live_tx.try_send(());
            }
        } else {
            let (live_tx, live_rx) = mpsc::channel(1);
            self.clients
                .write()
                .unwrap()
                .insert(id.to_string(), WearableClient { addr: peer, live_tx });
            let addr = InboxAddress::new(InboxAddressType::Wearable, id);
            msg.add_address = Some(addr.clone());
            msg.address = Some(addr);
            tokio::spawn(ping_wearable(
                self.socket.clone(),
                peer,
                id.to_string(),
                live_rx,
                self.remove_tx.clone(),
            ));
        }
    }

    #[cfg(test)]
    pub(crate) fn enqueue_removal(&self, id: &str) {
        let _ = self.remove_tx.send(id.to_string());
    }
}

#[async_trait]
impl InboxConnection for UdpConnection {
    async fn read(&self, msg: &mut InboxMessage) -> io::Result<()> {
        let mut remove_rx = self.remove_rx.lock().await;
        let mut buf = [0u8; 1024];
        tokio::select! {
            biased;
            removed = remove_rx.recv() => {
                if let Some(id) = removed {
                    self.clients.write().unwrap().remove(&id);
                    msg.remove_address =
                        Some(InboxAddress::new(InboxAddressType::Wearable, id));
                }
                Ok(())
            }
            received = self.socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, peer)) => {
                        if n >= WEARABLE_RECORD_LEN {
                            self.handle_record(&buf[..WEARABLE_RECORD_LEN], peer, msg);
                        } else {
                            debug!("dropping short wearable record ({} bytes)", n);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        // Transient; the socket stays up.
                        sleep(Duration::from_millis(10)).await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn write(&self, msg: &InboxMessage) -> io::Result<()> {
        let id = msg.get_str("id");
        let target = self.clients.read().unwrap().get(id).map(|c| c.addr);
        if let Some(addr) = target {
            let payload = format!("{}{}{}", msg.get_str("head"), id, msg.cmd());
            self.socket.send_to(payload.as_bytes(), addr).await?;
        }
        Ok(())
    }

    fn accept(&self, addr: &InboxAddress) -> bool {
        if addr.kind != InboxAddressType::Wearable {
            return false;
        }
        addr.is_wildcard() || self.clients.read().unwrap().contains_key(&addr.id)
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Per-wearable liveness loop: calibration ping, wait for any datagram from
/// the device, repeat. Silence or a send failure enqueues the id for removal
/// and ends the task.
async fn ping_wearable(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    id: String,
    mut live_rx: mpsc::Receiver<()>,
    remove_tx: mpsc::UnboundedSender<String>,
) {
    loop {
        let ping = format!("CAL{}00", id);
        if socket.send_to(ping.as_bytes(), peer).await.is_err() {
            let _ = remove_tx.send(id);
            return;
        }
        match timeout(LIVENESS_TIMEOUT, live_rx.recv()).await {
            Ok(Some(())) => sleep(PING_INTERVAL).await,
            _ => {
                let _ = remove_tx.send(id);
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket (tablets, simulators)
// ---------------------------------------------------------------------------

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

pub struct WsConnection {
    sink: Mutex<WsSink>,
    stream: Mutex<WsSource>,
    identity: RwLock<Option<InboxAddress>>,
}

impl WsConnection {
    /// Upgrade an accepted TCP stream to a WebSocket connection.
    pub async fn handshake(stream: TcpStream) -> io::Result<Self> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(ws_err)?;
        let (sink, source) = ws.split();
        Ok(WsConnection {
            sink: Mutex::new(sink),
            stream: Mutex::new(source),
            identity: RwLock::new(None),
        })
    }

    fn stamp_close(&self, msg: &mut InboxMessage) {
        msg.should_close_connection = true;
        if let Some(addr) = self.identity.read().unwrap().clone() {
            msg.remove_address = Some(addr);
        }
    }

    /// The first frame must be `init` with a numeric TYPE and a string ID;
    /// a later `init` declaring a different identity rebinds the connection.
    /// Unlike the TCP path, where the type derives from the id, type and id
    /// are independent here, so both take part in the comparison.
    fn apply_init_identity(&self, msg: &mut InboxMessage) {
        let kind = InboxAddressType::from_code(msg.get_u64("TYPE").unwrap_or(0));
        let addr = InboxAddress::new(kind, msg.get_str("ID"));
        let old = self.identity.read().unwrap().clone();
        if old.as_ref() == Some(&addr) {
            return;
        }
        msg.add_address = Some(addr.clone());
        msg.address = Some(addr.clone());
        if let Some(old) = old {
            msg.remove_address = Some(old);
        }
        *self.identity.write().unwrap() = Some(addr);
    }
}

#[async_trait]
impl InboxConnection for WsConnection {
    async fn read(&self, msg: &mut InboxMessage) -> io::Result<()> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                None => {
                    self.stamp_close(msg);
                    return Err(eof());
                }
                Some(Err(e)) => {
                    self.stamp_close(msg);
                    return Err(ws_err(e));
                }
                Some(Ok(Message::Close(_))) => {
                    self.stamp_close(msg);
                    return Err(eof());
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Value>(&text) {
                        Ok(Value::Object(map)) => {
                            msg.data = map;
                            break;
                        }
                        _ => {
                            // Malformed frame: drop it, keep the connection.
                            warn!("dropping non-object ws frame");
                            continue;
                        }
                    }
                }
                // Binary, ping and pong frames carry nothing for us.
                Some(Ok(_)) => continue,
            }
        }

        if msg.cmd() == "init" {
            self.apply_init_identity(msg);
        } else if let Some(addr) = self.identity.read().unwrap().clone() {
            msg.address = Some(addr);
        }
        Ok(())
    }

    async fn write(&self, msg: &InboxMessage) -> io::Result<()> {
        let body = msg
            .marshal()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(body)).await.map_err(ws_err)
    }

    fn accept(&self, addr: &InboxAddress) -> bool {
        match self.identity.read().unwrap().as_ref() {
            Some(current) => {
                current.kind == addr.kind && (addr.is_wildcard() || addr.id == current.id)
            }
            None => false,
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.sink.lock().await.close().await.map_err(ws_err)
    }
}

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}
