//! Match handles and the match event stream.
//!
//! The dispatcher sees a match as a black box: commands go in through the
//! handle, `Update` events come out while it runs, and exactly one `End`
//! event closes it. The simulation proper (physics, lasers, scoring) lives
//! behind this boundary; the run task here keeps the protocol honest with a
//! warmup delay, one update per second, and a stop on command or time-up.

use std::sync::Arc;

use arena_shared::InboxMessage;
use log::info;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration};

use crate::options::MatchOptions;

#[derive(Debug)]
pub enum MatchEvent {
    Update { id: u32, data: Value },
    End { id: u32 },
}

pub struct Match {
    pub id: u32,
    cmd_tx: mpsc::UnboundedSender<InboxMessage>,
}

impl Match {
    /// Create the handle and spawn the run task.
    pub fn spawn(
        id: u32,
        member_ids: Vec<String>,
        mode: String,
        options: Arc<MatchOptions>,
        events: mpsc::UnboundedSender<MatchEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_match(id, member_ids, mode, options, events, cmd_rx));
        Match { id, cmd_tx }
    }

    /// Forward a command message into the match. Dropped if the run task is
    /// already gone; the pending `End` event cleans the registry up.
    pub fn send_command(&self, msg: InboxMessage) {
        let _ = self.cmd_tx.send(msg);
    }
}

async fn run_match(
    id: u32,
    member_ids: Vec<String>,
    mode: String,
    options: Arc<MatchOptions>,
    events: mpsc::UnboundedSender<MatchEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<InboxMessage>,
) {
    info!("match {} starting (mode {}, {} players)", id, mode, member_ids.len());
    if options.warmup > 0.0 {
        sleep(Duration::from_secs_f64(options.warmup)).await;
    }

    let mut ticker = interval(Duration::from_secs(1));
    ticker.tick().await; // the first tick completes immediately
    let mut elapsed = 0.0f64;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(msg) if msg.cmd() == "stopMatch" => break,
                // Movement commands belong to the simulation; absorbed here.
                Some(_) => {}
                None => break,
            },
            _ = ticker.tick() => {
                elapsed += 1.0;
                let data = json!({
                    "matchID": id,
                    "mode": mode,
                    "elapsed": elapsed,
                    "member": member_ids,
                });
                let _ = events.send(MatchEvent::Update { id, data });
                if elapsed >= options.mode1_total_time {
                    break;
                }
            }
        }
    }

    info!("match {} ended after {:.0}s", id, elapsed);
    let _ = events.send(MatchEvent::End { id });
}
