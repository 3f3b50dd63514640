//! Match options loaded once at startup from a TOML file.
//!
//! The full options file also drives the simulation (arena geometry, laser
//! tuning, scoring tables); the server core only consumes the fields below
//! and echoes the rest of its copy to simulators on `init`. Options are
//! passed around as an `Arc`, never held in global state.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use arena_shared::InboxAddressType;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchOptions {
    /// Arena size in tiles, echoed to simulator clients.
    pub arena_width: u32,
    pub arena_height: u32,
    pub arena_cell_size: u32,
    pub arena_border: u32,

    /// Seconds between match creation and the first tick.
    pub warmup: f64,
    /// Mode-1 match length in seconds.
    pub mode1_total_time: f64,

    /// Score phase thresholds pushed to wall arduinos.
    pub t1: f64,
    pub t2: f64,
    pub t3: f64,
    pub t_rampage: f64,

    /// Ids of the configured main wall arduinos.
    pub main_arduino: Vec<String>,
    /// Ids of the configured small wall arduinos.
    pub sub_arduino: Vec<String>,
}

impl Default for MatchOptions {
    fn default() -> Self {
        MatchOptions {
            arena_width: 5,
            arena_height: 5,
            arena_cell_size: 120,
            arena_border: 10,
            warmup: 3.0,
            mode1_total_time: 180.0,
            t1: 30.0,
            t2: 60.0,
            t3: 90.0,
            t_rampage: 120.0,
            main_arduino: Vec::new(),
            sub_arduino: Vec::new(),
        }
    }
}

impl MatchOptions {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("read options file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parse options file {}", path.display()))
    }

    /// Arduino address type for a declared id. Ids on neither configured
    /// list resolve to MainArduino; the dispatcher drops them anyway.
    pub fn arduino_kind(&self, id: &str) -> InboxAddressType {
        if self.sub_arduino.iter().any(|s| s == id) {
            InboxAddressType::SubArduino
        } else {
            InboxAddressType::MainArduino
        }
    }

    /// Four-phase score table sent to arduinos in `init_score`.
    pub fn score_info(&self) -> Value {
        json!([
            { "time": self.t1, "status": "T1" },
            { "time": self.t2, "status": "T2" },
            { "time": self.t3, "status": "T3" },
            { "time": self.t_rampage, "status": "T4" },
        ])
    }
}
