//! JSON read API over the ingested store: the materialized event
//! projection and a live view of upcoming timetable entries.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Duration, NaiveDateTime, Utc};
use poolside_core::Event;
use poolside_ingest::{project_events, Store};
use serde::Serialize;
use sqlx::Row;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "poolside-web";

/// How far ahead `/api/entries` looks.
pub const ENTRIES_LOOKAHEAD_DAYS: i64 = 7;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

/// Flat row served from the materialized `events` table.
#[derive(Debug, Clone, Serialize)]
pub struct EventView {
    pub name: String,
    pub description: String,
    pub date: String,
    pub time: String,
    pub end_time: String,
    pub site_name: String,
    pub site_facility: String,
    pub level: i64,
    pub instructor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySiteView {
    pub name: String,
    pub facility: String,
}

/// Row computed live from the entries tables, site nested.
#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    pub name: String,
    pub description: String,
    pub date: String,
    pub time: String,
    pub end_time: String,
    pub level: i64,
    pub instructor: String,
    pub site: EntrySiteView,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/events", get(events_handler))
        .route("/api/entries", get(entries_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("POOLSIDE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://poolside.db?mode=rwc".to_string());
    let store = Store::connect(&database_url).await?;
    store.migrate().await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn events_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_events(&state.store, Utc::now().naive_utc()).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => server_error(err),
    }
}

async fn entries_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_entries(&state.store, Utc::now().naive_utc()).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

/// Future rows of the materialized projection, soonest first.
async fn load_events(store: &Store, now: NaiveDateTime) -> anyhow::Result<Vec<EventView>> {
    let rows = sqlx::query(
        "SELECT name, description, date_time, end_time, site_name, site_facility, level, instructor
           FROM events
          WHERE date_time >= ?
          ORDER BY date_time ASC",
    )
    .bind(now)
    .fetch_all(store.pool())
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let date_time: NaiveDateTime = row.try_get("date_time")?;
        let end_time: NaiveDateTime = row.try_get("end_time")?;
        out.push(EventView {
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            date: date_time.format("%Y-%m-%d").to_string(),
            time: date_time.format("%H:%M:%S").to_string(),
            end_time: end_time.format("%H:%M:%S").to_string(),
            site_name: row.try_get("site_name")?,
            site_facility: row.try_get("site_facility")?,
            level: row.try_get("level")?,
            instructor: row.try_get("instructor")?,
        });
    }
    Ok(out)
}

/// Same filters as the projection, computed live over the next
/// [`ENTRIES_LOOKAHEAD_DAYS`] days.
async fn load_entries(store: &Store, now: NaiveDateTime) -> anyhow::Result<Vec<EntryView>> {
    let horizon = now + Duration::days(ENTRIES_LOOKAHEAD_DAYS);
    let candidates = store
        .entry_join_rows_from(now)
        .await?
        .into_iter()
        .filter(|row| row.date_time <= horizon)
        .collect();
    Ok(project_events(candidates)
        .into_iter()
        .map(entry_view)
        .collect())
}

fn entry_view(event: Event) -> EntryView {
    EntryView {
        name: event.name,
        description: event.description,
        date: event.date_time.format("%Y-%m-%d").to_string(),
        time: event.date_time.format("%H:%M:%S").to_string(),
        end_time: event.end_time.format("%H:%M:%S").to_string(),
        level: event.level,
        instructor: event.instructor,
        site: EntrySiteView {
            name: event.site_name,
            facility: event.site_facility,
        },
    }
}
