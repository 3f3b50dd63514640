//! Connection registry and message routing.
//!
//! The inbox owns every live connection. Each one gets a reader loop that
//! funnels messages into the dispatcher's channel; outbound messages fan out
//! to whichever connections accept a target address. Receiving is fully
//! parallel (one task per connection); sending never blocks the dispatcher
//! because each write runs in its own task, serialized per connection by the
//! connection's write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arena_shared::{InboxAddress, InboxMessage};
use log::{debug, warn};
use tokio::sync::{mpsc, RwLock};

use crate::connection::InboxConnection;

pub struct Inbox {
    clients: RwLock<HashMap<u64, Arc<dyn InboxConnection>>>,
    next_id: AtomicU64,
    dispatcher_tx: mpsc::UnboundedSender<InboxMessage>,
}

impl Inbox {
    pub fn new(dispatcher_tx: mpsc::UnboundedSender<InboxMessage>) -> Self {
        Inbox {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dispatcher_tx,
        }
    }

    /// Register `conn` and read from it until it asks to be closed.
    ///
    /// Every message produced by a read is forwarded, including the final
    /// error-stamped one: that is how the dispatcher learns a device left.
    pub async fn listen(&self, conn: Arc<dyn InboxConnection>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().await.insert(id, conn.clone());
        debug!("connection {} registered", id);

        loop {
            let mut msg = InboxMessage::new();
            if let Err(e) = conn.read(&mut msg).await {
                debug!("connection {} read error: {}", id, e);
            }
            let should_close = msg.should_close_connection;
            if self.dispatcher_tx.send(msg).is_err() {
                break;
            }
            if should_close {
                break;
            }
        }

        let _ = conn.close().await;
        self.clients.write().await.remove(&id);
        debug!("connection {} removed", id);
    }

    /// Deliver `msg` to every connection accepting any of `targets`.
    ///
    /// Writes are spawned so a slow client cannot stall the caller; write
    /// errors are logged and never propagate (the reader loop notices a dead
    /// socket on its own).
    pub async fn send(&self, msg: &InboxMessage, targets: &[InboxAddress]) {
        let clients = self.clients.read().await;
        for (id, conn) in clients.iter() {
            for target in targets {
                if conn.accept(target) {
                    let conn = conn.clone();
                    let out = msg.clone();
                    let id = *id;
                    tokio::spawn(async move {
                        if let Err(e) = conn.write(&out).await {
                            warn!("write to connection {} failed: {}", id, e);
                        }
                    });
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn register_for_test(&self, conn: Arc<dyn InboxConnection>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().await.insert(id, conn);
        id
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    use arena_shared::InboxAddressType;
    use async_trait::async_trait;

    /// Test double: accepts a fixed identity, records every write.
    pub(crate) struct MockConnection {
        identity: InboxAddress,
        pub written: Mutex<Vec<InboxMessage>>,
    }

    impl MockConnection {
        pub(crate) fn new(kind: InboxAddressType, id: &str) -> Arc<Self> {
            Arc::new(MockConnection {
                identity: InboxAddress::new(kind, id),
                written: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn written_cmds(&self) -> Vec<String> {
            self.written
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.cmd().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl InboxConnection for MockConnection {
        async fn read(&self, _msg: &mut InboxMessage) -> io::Result<()> {
            std::future::pending().await
        }

        async fn write(&self, msg: &InboxMessage) -> io::Result<()> {
            self.written.lock().unwrap().push(msg.clone());
            Ok(())
        }

        fn accept(&self, addr: &InboxAddress) -> bool {
            self.identity.kind == addr.kind
                && (addr.is_wildcard() || addr.id == self.identity.id)
        }

        async fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn settle() {
        // let spawned write tasks run
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn send_writes_once_per_accepted_target() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let inbox = Inbox::new(tx);

        let admin = MockConnection::new(InboxAddressType::Admin, "a1");
        let sim = MockConnection::new(InboxAddressType::Simulator, "s1");
        inbox.register_for_test(admin.clone()).await;
        inbox.register_for_test(sim.clone()).await;

        let mut msg = InboxMessage::new();
        msg.set_cmd("ControllerData");
        inbox
            .send(
                &msg,
                &[
                    InboxAddress::wildcard(InboxAddressType::Admin),
                    InboxAddress::wildcard(InboxAddressType::Simulator),
                ],
            )
            .await;
        settle().await;

        assert_eq!(admin.written_cmds(), vec!["ControllerData"]);
        assert_eq!(sim.written_cmds(), vec!["ControllerData"]);
    }

    #[tokio::test]
    async fn send_filters_by_exact_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let inbox = Inbox::new(tx);

        let a1 = MockConnection::new(InboxAddressType::Admin, "a1");
        let a2 = MockConnection::new(InboxAddressType::Admin, "a2");
        inbox.register_for_test(a1.clone()).await;
        inbox.register_for_test(a2.clone()).await;

        let mut msg = InboxMessage::new();
        msg.set_cmd("init");
        inbox
            .send(&msg, &[InboxAddress::new(InboxAddressType::Admin, "a2")])
            .await;
        settle().await;

        assert!(a1.written_cmds().is_empty());
        assert_eq!(a2.written_cmds(), vec!["init"]);
    }

    #[tokio::test]
    async fn send_to_unmatched_type_reaches_nobody() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let inbox = Inbox::new(tx);

        let admin = MockConnection::new(InboxAddressType::Admin, "a1");
        inbox.register_for_test(admin.clone()).await;

        let msg = InboxMessage::new();
        inbox
            .send(&msg, &[InboxAddress::wildcard(InboxAddressType::Wearable)])
            .await;
        settle().await;

        assert!(admin.written_cmds().is_empty());
    }
}
