//! Match history persistence over SQLite.
//!
//! The dispatcher is the only writer: it creates a row when a match starts
//! and the allocated row id becomes the match id everywhere else. History
//! reads serve the exit-hall displays.

use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlayerData {
    pub id: u32,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub name: String,
    pub gold: i64,
    #[serde(rename = "lostGold")]
    pub lost_gold: i64,
    pub energy: f64,
    pub combo: i64,
    pub grade: String,
    pub level: i64,
    #[serde(rename = "levelData")]
    pub level_data: String,
    #[serde(rename = "hitCount")]
    pub hit_count: i64,
    #[serde(rename = "cid")]
    pub controller_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchData {
    pub id: u32,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub mode: String,
    pub elapsed: f64,
    pub gold: i64,
    #[serde(rename = "rampageCount")]
    pub rampage_count: i64,
    #[serde(rename = "answerType")]
    pub answer_type: i64,
    #[serde(rename = "teamID")]
    pub team_id: String,
    pub member: Vec<PlayerData>,
}

impl MatchData {
    pub fn new(mode: &str) -> Self {
        MatchData {
            mode: mode.to_string(),
            ..MatchData::default()
        }
    }
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn =
            Connection::open(path).with_context(|| format!("open database {}", path))?;
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        Ok(db)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                mode TEXT NOT NULL DEFAULT '',
                elapsed REAL NOT NULL DEFAULT 0,
                gold INTEGER NOT NULL DEFAULT 0,
                rampage_count INTEGER NOT NULL DEFAULT 0,
                answer_type INTEGER NOT NULL DEFAULT 0,
                team_id TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS players (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                match_id INTEGER NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                gold INTEGER NOT NULL DEFAULT 0,
                lost_gold INTEGER NOT NULL DEFAULT 0,
                energy REAL NOT NULL DEFAULT 0,
                combo INTEGER NOT NULL DEFAULT 0,
                grade TEXT NOT NULL DEFAULT '',
                level INTEGER NOT NULL DEFAULT 0,
                level_data TEXT NOT NULL DEFAULT '',
                hit_count INTEGER NOT NULL DEFAULT 0,
                controller_id TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;
        Ok(())
    }

    /// Insert a match row and return the allocated id.
    pub fn save_match(&self, data: &MatchData) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO matches (mode, elapsed, gold, rampage_count, answer_type, team_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                data.mode,
                data.elapsed,
                data.gold,
                data.rampage_count,
                data.answer_type,
                data.team_id,
            ],
        )
        .context("insert match row")?;
        Ok(conn.last_insert_rowid() as u32)
    }

    pub fn save_player(&self, match_id: u32, player: &PlayerData) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO players (match_id, name, gold, lost_gold, energy, combo,
                                  grade, level, level_data, hit_count, controller_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                match_id,
                player.name,
                player.gold,
                player.lost_gold,
                player.energy,
                player.combo,
                player.grade,
                player.level,
                player.level_data,
                player.hit_count,
                player.controller_id,
            ],
        )
        .context("insert player row")?;
        Ok(conn.last_insert_rowid() as u32)
    }

    /// Most recent matches with their members, newest first.
    pub fn history(&self, limit: u32) -> Result<Vec<MatchData>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, mode, elapsed, gold, rampage_count, answer_type, team_id
             FROM matches ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(MatchData {
                id: row.get(0)?,
                created_at: row.get(1)?,
                mode: row.get(2)?,
                elapsed: row.get(3)?,
                gold: row.get(4)?,
                rampage_count: row.get(5)?,
                answer_type: row.get(6)?,
                team_id: row.get(7)?,
                member: Vec::new(),
            })
        })?;

        let mut matches = Vec::new();
        for row in rows {
            let mut m = row.context("read match row")?;
            m.member = Self::players_of(&conn, m.id)?;
            matches.push(m);
        }
        Ok(matches)
    }

    fn players_of(conn: &Connection, match_id: u32) -> Result<Vec<PlayerData>> {
        let mut stmt = conn.prepare(
            "SELECT id, created_at, name, gold, lost_gold, energy, combo,
                    grade, level, level_data, hit_count, controller_id
             FROM players WHERE match_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![match_id], |row| {
            Ok(PlayerData {
                id: row.get(0)?,
                created_at: row.get(1)?,
                name: row.get(2)?,
                gold: row.get(3)?,
                lost_gold: row.get(4)?,
                energy: row.get(5)?,
                combo: row.get(6)?,
                grade: row.get(7)?,
                level: row.get(8)?,
                level_data: row.get(9)?,
                hit_count: row.get(10)?,
                controller_id: row.get(11)?,
            })
        })?;

        let mut players = Vec::new();
        for row in rows {
            players.push(row.context("read player row")?);
        }
        Ok(players)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Database {
        Database::open(":memory:").unwrap()
    }

    #[test]
    fn match_ids_are_sequential_rowids() {
        let db = memory_db();
        assert_eq!(db.save_match(&MatchData::new("m1")).unwrap(), 1);
        assert_eq!(db.save_match(&MatchData::new("m2")).unwrap(), 2);
    }

    #[test]
    fn history_returns_newest_first_with_members() {
        let db = memory_db();
        let first = db.save_match(&MatchData::new("m1")).unwrap();
        let second = db.save_match(&MatchData::new("m2")).unwrap();

        let player = PlayerData {
            name: "p1".into(),
            gold: 30,
            controller_id: "2:s1".into(),
            ..PlayerData::default()
        };
        db.save_player(first, &player).unwrap();

        let history = db.history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second);
        assert_eq!(history[1].id, first);
        assert_eq!(history[1].member.len(), 1);
        assert_eq!(history[1].member[0].gold, 30);
        assert!(!history[0].created_at.is_empty());
    }

    #[test]
    fn history_respects_limit() {
        let db = memory_db();
        for i in 0..5 {
            db.save_match(&MatchData::new(&format!("m{}", i))).unwrap();
        }
        assert_eq!(db.history(3).unwrap().len(), 3);
    }
}
