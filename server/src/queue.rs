//! Waiting queue of player teams.
//!
//! Teams line up in arrival order; ids come from a cursor that starts at
//! 2000 and survives everything except a reset. The dispatcher drives every
//! mutator from admin commands and broadcasts the new queue state whenever
//! one reports a change; the HTTP admin surface is the one other caller,
//! which is why the queue lives behind a lock.

use std::collections::VecDeque;

use anyhow::{bail, Result};
use serde::Serialize;

const INIT_CURSOR: i32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamState {
    Waiting,
    Called,
    Prepared,
}

#[derive(Debug, Clone, Serialize)]
pub struct Team {
    pub id: i32,
    pub size: u32,
    pub mode: String,
    pub state: TeamState,
}

#[derive(Debug)]
pub struct Queue {
    teams: VecDeque<Team>,
    cursor: i32,
}

impl Default for Queue {
    fn default() -> Self {
        Queue::new()
    }
}

impl Queue {
    pub fn new() -> Self {
        Queue {
            teams: VecDeque::new(),
            cursor: INIT_CURSOR,
        }
    }

    /// Append a team and return its freshly allocated id.
    pub fn add(&mut self, size: u32, mode: &str) -> i32 {
        self.cursor += 1;
        self.teams.push_back(Team {
            id: self.cursor,
            size,
            mode: mode.to_string(),
            state: TeamState::Waiting,
        });
        self.cursor
    }

    /// Empty the queue and rewind the id cursor.
    pub fn reset(&mut self) -> i32 {
        self.teams.clear();
        self.cursor = INIT_CURSOR;
        self.cursor
    }

    pub fn query(&self) -> Vec<Team> {
        self.teams.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    fn position(&self, id: i32) -> Option<usize> {
        self.teams.iter().position(|t| t.id == id)
    }

    /// Move the team to the head of the queue.
    pub fn cut_line(&mut self, id: i32) -> bool {
        match self.position(id) {
            Some(pos) => {
                let team = self.teams.remove(pos).unwrap();
                self.teams.push_front(team);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: i32) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.teams.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn change_mode(&mut self, id: i32, mode: &str) -> bool {
        match self.position(id).and_then(|p| self.teams.get_mut(p)) {
            Some(team) => {
                team.mode = mode.to_string();
                true
            }
            None => false,
        }
    }

    /// Move the team one slot back; the last team stays put.
    pub fn delay(&mut self, id: i32) -> bool {
        match self.position(id) {
            Some(pos) if pos + 1 < self.teams.len() => {
                self.teams.swap(pos, pos + 1);
                true
            }
            _ => false,
        }
    }

    pub fn add_player(&mut self, id: i32) -> bool {
        match self.position(id).and_then(|p| self.teams.get_mut(p)) {
            Some(team) => {
                team.size += 1;
                true
            }
            None => false,
        }
    }

    /// Team size floors at one player.
    pub fn remove_player(&mut self, id: i32) -> bool {
        match self.position(id).and_then(|p| self.teams.get_mut(p)) {
            Some(team) if team.size > 1 => {
                team.size -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn prepare(&mut self, id: i32) -> bool {
        self.set_state(id, TeamState::Prepared)
    }

    pub fn call(&mut self, id: i32) -> bool {
        self.set_state(id, TeamState::Called)
    }

    /// Starting a team removes it: the queue holds pending teams only.
    pub fn start(&mut self, id: i32) -> bool {
        self.remove(id)
    }

    fn set_state(&mut self, id: i32, state: TeamState) -> bool {
        match self.position(id).and_then(|p| self.teams.get_mut(p)) {
            Some(team) => {
                team.state = state;
                true
            }
            None => false,
        }
    }

    /// Up to `count` teams whose ids follow `previous_id`; 0 slices from the
    /// head. An unknown id yields an empty slice. Backs the hall board's
    /// `queryTeams` pagination.
    pub fn teams_after(&self, previous_id: i32, count: usize) -> Result<Vec<Team>> {
        if previous_id < 0 {
            bail!("previous team id must be >= 0, got {}", previous_id);
        }
        let start = if previous_id == 0 {
            0
        } else {
            match self.position(previous_id) {
                Some(pos) => pos + 1,
                None => return Ok(Vec::new()),
            }
        };
        Ok(self
            .teams
            .iter()
            .skip(start)
            .take(count)
            .cloned()
            .collect())
    }
}
