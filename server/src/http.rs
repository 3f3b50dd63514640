//! HTTP admin surface for the front desk.
//!
//! Endpoints the ticket counter and the hall board use: enqueue a walk-in
//! team, wipe the queue between sessions, and page through the waiting list.
//! The mutators touch the shared queue directly; admins see the result on
//! their next `queryHallData`.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::queue::Queue;

#[derive(Clone)]
pub struct AdminState {
    pub queue: Arc<Mutex<Queue>>,
}

pub fn router(queue: Arc<Mutex<Queue>>) -> Router {
    Router::new()
        .route("/addTeam", post(add_team))
        .route("/resetQueue", post(reset_queue))
        .route("/queryTeams", post(query_teams))
        .with_state(AdminState { queue })
}

#[derive(Debug, Deserialize)]
struct AddTeamForm {
    count: u32,
    #[serde(default)]
    mode: String,
}

/// `POST /addTeam` with form fields `count` and `mode` -> `{"id": n}`.
async fn add_team(State(state): State<AdminState>, Form(form): Form<AddTeamForm>) -> Json<Value> {
    let id = state.queue.lock().unwrap().add(form.count, &form.mode);
    Json(json!({ "id": id }))
}

/// `POST /resetQueue` -> `{"id": 2000}`.
async fn reset_queue(State(state): State<AdminState>) -> Json<Value> {
    let id = state.queue.lock().unwrap().reset();
    Json(json!({ "id": id }))
}

#[derive(Debug, Deserialize)]
struct QueryTeamsForm {
    /// Last team id the board already shows; 0 pages from the head.
    #[serde(rename = "previousID", default)]
    previous_id: i32,
    count: usize,
}

/// `POST /queryTeams` with `previousID` and `count` -> `{"teams": [...]}`.
async fn query_teams(
    State(state): State<AdminState>,
    Form(form): Form<QueryTeamsForm>,
) -> Result<Json<Value>, StatusCode> {
    let teams = state
        .queue
        .lock()
        .unwrap()
        .teams_after(form.previous_id, form.count)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok(Json(json!({ "teams": teams })))
}
