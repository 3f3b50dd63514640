//! Logical devices registered with the dispatcher.
//!
//! Player controllers (simulators, wearables) come and go with their
//! connections. Arduino controllers are preconfigured from options and never
//! leave the registry; connects and disconnects only flip their flags.

use arena_shared::InboxAddress;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PlayerController {
    pub address: InboxAddress,
    pub id: String,
    /// Id of the match this player is bound to; 0 means none.
    #[serde(rename = "matchID")]
    pub match_id: u32,
}

impl PlayerController {
    pub fn new(address: InboxAddress) -> Self {
        let id = address.to_string();
        PlayerController {
            address,
            id,
            match_id: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArduinoController {
    pub address: InboxAddress,
    pub id: String,
    pub online: bool,
    #[serde(rename = "scoreUpdated")]
    pub score_updated: bool,
}

impl ArduinoController {
    pub fn new(address: InboxAddress) -> Self {
        let id = address.to_string();
        ArduinoController {
            address,
            id,
            online: false,
            score_updated: false,
        }
    }

    /// The score table must be (re)pushed whenever the device has not
    /// confirmed the current one.
    pub fn needs_score_push(&self) -> bool {
        !self.score_updated
    }
}
