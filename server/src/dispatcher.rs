//! The single-task event loop that owns all application state.
//!
//! Every inbound message and every match event funnels into this task, so
//! the controller registries, the match registry and the queue need no locks
//! of their own. Each step handles exactly one message or event to
//! completion before the next is taken; broadcasts it triggers are handed to
//! the inbox before the step ends, preserving causal order as clients see
//! it.
//!
//! Inbound handling is two-phased: membership updates stamped by the
//! connection (`add_address` / `remove_address`) are applied first, then the
//! command itself is parsed into a typed verb and dispatched by the sender's
//! address type. The dynamic key/value body is only the wire form; anything
//! the handlers consume is extracted here, at the boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arena_shared::{InboxAddress, InboxAddressType, InboxMessage};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::controllers::{ArduinoController, PlayerController};
use crate::db::{Database, MatchData};
use crate::game::{Match, MatchEvent};
use crate::inbox::Inbox;
use crate::options::MatchOptions;
use crate::queue::Queue;

/// Administrative verbs, parsed from the wire body.
#[derive(Debug)]
enum AdminCommand {
    Init,
    QueryHallData,
    QueryControllerData,
    TeamCutLine { team_id: i32 },
    TeamRemove { team_id: i32 },
    TeamChangeMode { team_id: i32, mode: String },
    TeamDelay { team_id: i32 },
    TeamAddPlayer { team_id: i32 },
    TeamRemovePlayer { team_id: i32 },
    TeamPrepare { team_id: i32 },
    TeamStart { team_id: i32, mode: String, controller_ids: Vec<String> },
    TeamCall { team_id: i32 },
    ArduinoModeChange { mode: u64 },
    QueryArduinoList,
}

impl AdminCommand {
    fn parse(msg: &InboxMessage) -> Option<Self> {
        let team_id = || msg.get_str("teamID").parse::<i32>().ok();
        match msg.cmd() {
            "init" => Some(AdminCommand::Init),
            "queryHallData" => Some(AdminCommand::QueryHallData),
            "queryControllerData" => Some(AdminCommand::QueryControllerData),
            "teamCutLine" => Some(AdminCommand::TeamCutLine { team_id: team_id()? }),
            "teamRemove" => Some(AdminCommand::TeamRemove { team_id: team_id()? }),
            "teamChangeMode" => Some(AdminCommand::TeamChangeMode {
                team_id: team_id()?,
                mode: msg.get_str("mode").to_string(),
            }),
            "teamDelay" => Some(AdminCommand::TeamDelay { team_id: team_id()? }),
            "teamAddPlayer" => Some(AdminCommand::TeamAddPlayer { team_id: team_id()? }),
            "teamRemovePlayer" => Some(AdminCommand::TeamRemovePlayer { team_id: team_id()? }),
            "teamPrepare" => Some(AdminCommand::TeamPrepare { team_id: team_id()? }),
            "teamStart" => Some(AdminCommand::TeamStart {
                team_id: team_id()?,
                mode: msg.get_str("mode").to_string(),
                controller_ids: msg
                    .get_str("ids")
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            }),
            "teamCall" => Some(AdminCommand::TeamCall { team_id: team_id()? }),
            "arduinoModeChange" => Some(AdminCommand::ArduinoModeChange {
                mode: msg.get_u64("mode")?,
            }),
            "queryArduinoList" => Some(AdminCommand::QueryArduinoList),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum SimulatorCommand {
    Init,
    StartMatch { mode: String },
    /// `stopMatch`, `playerMove` and `playerStop` all forward wholesale to
    /// the addressed match.
    MatchCommand { match_id: u32 },
}

impl SimulatorCommand {
    fn parse(msg: &InboxMessage) -> Option<Self> {
        match msg.cmd() {
            "init" => Some(SimulatorCommand::Init),
            "startMatch" => Some(SimulatorCommand::StartMatch {
                mode: msg.get_str("mode").to_string(),
            }),
            "stopMatch" | "playerMove" | "playerStop" => Some(SimulatorCommand::MatchCommand {
                match_id: msg.get_u64("matchID")? as u32,
            }),
            _ => None,
        }
    }
}

pub struct Dispatcher {
    inbox: Arc<Inbox>,
    queue: Arc<Mutex<Queue>>,
    db: Database,
    options: Arc<MatchOptions>,
    players: HashMap<String, PlayerController>,
    arduinos: HashMap<String, ArduinoController>,
    matches: HashMap<u32, Match>,
    msg_rx: mpsc::UnboundedReceiver<InboxMessage>,
    event_tx: mpsc::UnboundedSender<MatchEvent>,
    event_rx: mpsc::UnboundedReceiver<MatchEvent>,
}

impl Dispatcher {
    pub fn new(
        inbox: Arc<Inbox>,
        queue: Arc<Mutex<Queue>>,
        db: Database,
        options: Arc<MatchOptions>,
        msg_rx: mpsc::UnboundedReceiver<InboxMessage>,
        event_tx: mpsc::UnboundedSender<MatchEvent>,
        event_rx: mpsc::UnboundedReceiver<MatchEvent>,
    ) -> Self {
        // The arduino registry is fixed at startup; connects only flip flags.
        let mut arduinos = HashMap::new();
        for id in &options.main_arduino {
            let addr = InboxAddress::new(InboxAddressType::MainArduino, id);
            arduinos.insert(addr.to_string(), ArduinoController::new(addr));
        }
        for id in &options.sub_arduino {
            let addr = InboxAddress::new(InboxAddressType::SubArduino, id);
            arduinos.insert(addr.to_string(), ArduinoController::new(addr));
        }

        Dispatcher {
            inbox,
            queue,
            db,
            options,
            players: HashMap::new(),
            arduinos,
            matches: HashMap::new(),
            msg_rx,
            event_tx,
            event_rx,
        }
    }

    pub async fn run(mut self) {
        info!("dispatcher running");
        loop {
            tokio::select! {
                msg = self.msg_rx.recv() => match msg {
                    Some(msg) => self.handle_inbox_message(msg).await,
                    None => break,
                },
                evt = self.event_rx.recv() => match evt {
                    Some(evt) => self.handle_match_event(evt).await,
                    None => break,
                },
            }
        }
        info!("dispatcher stopped");
    }

    async fn handle_inbox_message(&mut self, msg: InboxMessage) {
        let mut controllers_changed = false;

        if let Some(removed) = msg.remove_address.clone() {
            if removed.kind.is_player_controller() {
                let key = removed.to_string();
                if let Some(pc) = self.players.get(&key) {
                    if pc.match_id > 0 {
                        if let Some(m) = self.matches.get(&pc.match_id) {
                            m.send_command(msg.clone());
                        }
                    }
                }
                self.players.remove(&key);
                controllers_changed = true;
            }
        }
        if let Some(added) = msg.add_address.clone() {
            if added.kind.is_player_controller() {
                let pc = PlayerController::new(added);
                self.players.insert(pc.id.clone(), pc);
                controllers_changed = true;
            }
        }
        if controllers_changed {
            self.broadcast(
                "ControllerData",
                Some(self.controller_data()),
                &[InboxAddressType::Admin, InboxAddressType::Simulator],
            )
            .await;
        }

        if let Some(removed) = &msg.remove_address {
            if removed.kind.is_arduino_controller() {
                if let Some(controller) = self.arduinos.get_mut(&removed.to_string()) {
                    controller.online = false;
                    controller.score_updated = false;
                }
            }
        }
        if let Some(added) = &msg.add_address {
            if added.kind.is_arduino_controller() {
                let mut push_to = None;
                match self.arduinos.get_mut(&added.to_string()) {
                    Some(controller) => {
                        controller.online = true;
                        if controller.needs_score_push() {
                            push_to = Some(controller.address.clone());
                        }
                    }
                    None => warn!("arduino connection not in configured list: {}", added),
                }
                if let Some(addr) = push_to {
                    self.push_score(addr).await;
                }
            }
        }

        let Some(address) = msg.address.clone() else {
            debug!("message has no address: {:?}", msg.data);
            return;
        };
        if msg.cmd().is_empty() {
            debug!("message has no cmd: {:?}", msg.data);
            return;
        }

        match address.kind {
            InboxAddressType::Simulator => self.handle_simulator(&address, &msg).await,
            InboxAddressType::ArduinoTest => {
                // debugging loopback: fan the message out to every wall
                self.inbox
                    .send(
                        &msg,
                        &[
                            InboxAddress::wildcard(InboxAddressType::SubArduino),
                            InboxAddress::wildcard(InboxAddressType::MainArduino),
                        ],
                    )
                    .await;
            }
            InboxAddressType::Admin => self.handle_admin(&address, &msg).await,
            InboxAddressType::MainArduino | InboxAddressType::SubArduino => {
                self.handle_arduino(&address, &msg);
            }
            _ => {}
        }
    }

    async fn handle_match_event(&mut self, evt: MatchEvent) {
        match evt {
            MatchEvent::Update { data, .. } => {
                self.broadcast(
                    "updateMatch",
                    Some(data),
                    &[InboxAddressType::Simulator, InboxAddressType::Admin],
                )
                .await;
            }
            MatchEvent::End { id } => {
                self.matches.remove(&id);
                for pc in self.players.values_mut() {
                    if pc.match_id == id {
                        pc.match_id = 0;
                    }
                }
                self.broadcast(
                    "matchStop",
                    Some(json!(id)),
                    &[InboxAddressType::Simulator, InboxAddressType::Admin],
                )
                .await;
            }
        }
    }

    fn handle_arduino(&mut self, address: &InboxAddress, msg: &InboxMessage) {
        if msg.cmd() == "confirm_init_score" {
            if let Some(controller) = self.arduinos.get_mut(&address.to_string()) {
                controller.score_updated = true;
            }
        }
    }

    async fn handle_simulator(&mut self, address: &InboxAddress, msg: &InboxMessage) {
        let Some(cmd) = SimulatorCommand::parse(msg) else {
            debug!("unhandled simulator command {:?}", msg.cmd());
            return;
        };
        match cmd {
            SimulatorCommand::Init => {
                let data = json!({
                    "options": &*self.options,
                    "ID": address.id,
                });
                self.send_to(address.clone(), "init", Some(data)).await;
            }
            SimulatorCommand::StartMatch { mode } => {
                let ids: Vec<String> = self
                    .players
                    .values()
                    .filter(|pc| pc.address.kind == InboxAddressType::Simulator)
                    .map(|pc| pc.id.clone())
                    .collect();
                self.start_new_match(&ids, &mode).await;
            }
            SimulatorCommand::MatchCommand { match_id } => {
                if let Some(m) = self.matches.get(&match_id) {
                    m.send_command(msg.clone());
                }
            }
        }
    }

    async fn handle_admin(&mut self, address: &InboxAddress, msg: &InboxMessage) {
        let Some(cmd) = AdminCommand::parse(msg) else {
            debug!("unhandled admin command {:?}", msg.cmd());
            return;
        };
        match cmd {
            AdminCommand::Init => {
                self.send_to(address.clone(), "init", None).await;
            }
            AdminCommand::QueryHallData => {
                self.broadcast_hall_data().await;
            }
            AdminCommand::QueryControllerData => {
                let data = self.controller_data();
                self.send_to(address.clone(), "ControllerData", Some(data)).await;
            }
            AdminCommand::TeamCutLine { team_id } => {
                let changed = self.queue.lock().unwrap().cut_line(team_id);
                self.hall_data_if(changed).await;
            }
            AdminCommand::TeamRemove { team_id } => {
                let changed = self.queue.lock().unwrap().remove(team_id);
                self.hall_data_if(changed).await;
            }
            AdminCommand::TeamChangeMode { team_id, mode } => {
                let changed = self.queue.lock().unwrap().change_mode(team_id, &mode);
                self.hall_data_if(changed).await;
            }
            AdminCommand::TeamDelay { team_id } => {
                let changed = self.queue.lock().unwrap().delay(team_id);
                self.hall_data_if(changed).await;
            }
            AdminCommand::TeamAddPlayer { team_id } => {
                let changed = self.queue.lock().unwrap().add_player(team_id);
                self.hall_data_if(changed).await;
            }
            AdminCommand::TeamRemovePlayer { team_id } => {
                let changed = self.queue.lock().unwrap().remove_player(team_id);
                self.hall_data_if(changed).await;
            }
            AdminCommand::TeamPrepare { team_id } => {
                let changed = self.queue.lock().unwrap().prepare(team_id);
                self.hall_data_if(changed).await;
            }
            AdminCommand::TeamCall { team_id } => {
                let changed = self.queue.lock().unwrap().call(team_id);
                self.hall_data_if(changed).await;
            }
            AdminCommand::TeamStart { team_id, mode, controller_ids } => {
                let changed = self.queue.lock().unwrap().start(team_id);
                self.hall_data_if(changed).await;
                self.start_new_match(&controller_ids, &mode).await;
            }
            AdminCommand::ArduinoModeChange { mode } => {
                let mut out = InboxMessage::new();
                out.set_cmd("mode_change");
                out.set("mode", mode.to_string());
                self.inbox
                    .send(
                        &out,
                        &[
                            InboxAddress::wildcard(InboxAddressType::MainArduino),
                            InboxAddress::wildcard(InboxAddressType::SubArduino),
                        ],
                    )
                    .await;
            }
            AdminCommand::QueryArduinoList => {
                let list: Vec<&ArduinoController> = self.arduinos.values().collect();
                let data = serde_json::to_value(&list).unwrap_or(Value::Null);
                self.send_to(address.clone(), "ArduinoList", Some(data)).await;
            }
        }
    }

    /// Persist a match row, bind the named players and spawn the run task.
    /// Callers are expected to pass existing controller ids; strays are
    /// logged and skipped rather than taking the process down mid-event.
    async fn start_new_match(&mut self, controller_ids: &[String], mode: &str) {
        let mid = match self.db.save_match(&MatchData::new(mode)) {
            Ok(mid) => mid,
            Err(e) => {
                error!("save match failed: {:#}", e);
                return;
            }
        };
        for id in controller_ids {
            match self.players.get_mut(id) {
                Some(pc) => pc.match_id = mid,
                None => warn!("unknown controller id {} for match {}", id, mid),
            }
        }
        let m = Match::spawn(
            mid,
            controller_ids.to_vec(),
            mode.to_string(),
            self.options.clone(),
            self.event_tx.clone(),
        );
        self.matches.insert(mid, m);
        self.broadcast(
            "newMatch",
            Some(json!(mid)),
            &[InboxAddressType::Admin, InboxAddressType::Simulator],
        )
        .await;
    }

    async fn push_score(&self, to: InboxAddress) {
        let mut msg = InboxMessage::new();
        msg.set_cmd("init_score");
        msg.set("score", self.options.score_info());
        self.inbox.send(&msg, &[to]).await;
    }

    fn controller_data(&self) -> Value {
        let list: Vec<&PlayerController> = self.players.values().collect();
        serde_json::to_value(&list).unwrap_or(Value::Null)
    }

    async fn hall_data_if(&self, changed: bool) {
        if changed {
            self.broadcast_hall_data().await;
        }
    }

    async fn broadcast_hall_data(&self) {
        let teams = self.queue.lock().unwrap().query();
        let data = serde_json::to_value(&teams).unwrap_or(Value::Null);
        self.broadcast("HallData", Some(data), &[InboxAddressType::Admin]).await;
    }

    async fn broadcast(&self, cmd: &str, data: Option<Value>, kinds: &[InboxAddressType]) {
        let targets: Vec<InboxAddress> =
            kinds.iter().map(|k| InboxAddress::wildcard(*k)).collect();
        self.send_message(cmd, data, &targets).await;
    }

    async fn send_to(&self, target: InboxAddress, cmd: &str, data: Option<Value>) {
        self.send_message(cmd, data, &[target]).await;
    }

    async fn send_message(&self, cmd: &str, data: Option<Value>, targets: &[InboxAddress]) {
        let mut msg = InboxMessage::new();
        msg.set_cmd(cmd);
        if let Some(data) = data {
            msg.set("data", data);
        }
        self.inbox.send(&msg, targets).await;
    }
}
