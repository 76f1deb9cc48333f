//! Staged ingest pipeline: fetch sites, timetables, sessions and entries
//! from the upstream API, persist them in dependency order, then
//! materialize the public event projection.
//!
//! Each stage is an explicit function whose typed output feeds the next
//! stage; fan-out happens inside a stage and is always joined all-of-N
//! before its results are consumed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use poolside_api::{ApiClient, EntryPayload, EnvelopeFetcher, TimetablePayload};
use poolside_core::{strip_html, Event, Site, SessionKey, Timetable, TimetableEntry, TimetableSession};
use poolside_storage::{CachedFetcher, HttpClientConfig, HttpFetcher, ResponseCache};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::task::JoinSet;
use tracing::info;

pub const CRATE_NAME: &str = "poolside-ingest";

/// Entries longer than this never reach the public event projection.
pub const MAX_EVENT_DURATION_SECS: i64 = 3600;

/// Case-sensitive substrings that exclude an entry from the projection.
pub const EXCLUDED_NAME_TERMS: [&str; 2] = ["Swimming", "Closed"];

/// Sites ingested when `POOLSIDE_SITE_IDS` is not set.
pub const DEFAULT_SITE_IDS: [i64; 3] = [2244, 2249, 2255];

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub api_key: String,
    pub base_url: String,
    pub cache_dir: PathBuf,
    pub database_url: String,
    pub site_ids: Vec<i64>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl IngestConfig {
    /// Environment is read once at startup; the API key is the only
    /// required variable.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("POOLSIDE_API_KEY")
            .context("POOLSIDE_API_KEY must be set (the upstream rejects keyless requests)")?;
        let site_ids = match std::env::var("POOLSIDE_SITE_IDS") {
            Ok(raw) => raw
                .split(',')
                .map(|part| {
                    part.trim()
                        .parse::<i64>()
                        .with_context(|| format!("invalid site id {part:?} in POOLSIDE_SITE_IDS"))
                })
                .collect::<Result<Vec<_>>>()?,
            Err(_) => DEFAULT_SITE_IDS.to_vec(),
        };
        Ok(Self {
            api_key,
            base_url: std::env::var("POOLSIDE_BASE_URL")
                .unwrap_or_else(|_| "https://api.activeintime.com".to_string()),
            cache_dir: std::env::var("POOLSIDE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cache")),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://poolside.db?mode=rwc".to_string()),
            site_ids,
            user_agent: std::env::var("POOLSIDE_USER_AGENT")
                .unwrap_or_else(|_| poolside_storage::BROWSER_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("POOLSIDE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        })
    }

    /// Cached, envelope-unwrapping client for the configured upstream.
    pub fn build_api_client(&self) -> Result<ApiClient> {
        let http = HttpFetcher::new(HttpClientConfig {
            user_agent: self.user_agent.clone(),
            timeout: Some(Duration::from_secs(self.http_timeout_secs)),
        })?;
        let fetcher = CachedFetcher::new(
            ResponseCache::new(self.cache_dir.clone()),
            Box::new(EnvelopeFetcher::new(Box::new(http))),
        );
        Ok(ApiClient::new(fetcher, self.base_url.clone(), self.api_key.clone()))
    }
}

// ---------------------------------------------------------------------------
// Relational store

/// SQLite-backed sink for the ingest run. Rows are created once per run
/// and never updated; re-running against a populated store surfaces
/// uniqueness conflicts.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("connecting to sqlite store")?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory store, used by tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory sqlite url")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory sqlite store")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS sites (
                site_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                timezone TEXT NOT NULL,
                tldc_approved INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS contacts (
                site_id INTEGER PRIMARY KEY REFERENCES sites (site_id),
                address_line_1 TEXT NOT NULL,
                address_line_2 TEXT NOT NULL,
                post_code TEXT NOT NULL,
                post_town TEXT NOT NULL,
                country TEXT,
                telephone TEXT,
                website TEXT,
                latitude TEXT,
                longitude TEXT
            )",
            "CREATE TABLE IF NOT EXISTS facilities (
                site_id INTEGER NOT NULL REFERENCES sites (site_id),
                facility_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                length REAL,
                tldc_approved INTEGER NOT NULL,
                PRIMARY KEY (site_id, facility_id)
            )",
            "CREATE TABLE IF NOT EXISTS timetable_sessions (
                timetable_id INTEGER NOT NULL,
                session_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                category TEXT NOT NULL,
                description TEXT NOT NULL,
                PRIMARY KEY (timetable_id, session_id)
            )",
            "CREATE TABLE IF NOT EXISTS timetables (
                timetable_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                site_id INTEGER NOT NULL REFERENCES sites (site_id)
            )",
            "CREATE TABLE IF NOT EXISTS timetable_entries (
                entry_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                date_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                facility_name TEXT NOT NULL,
                instructor_name TEXT NOT NULL,
                level INTEGER NOT NULL,
                is_cancelled INTEGER NOT NULL,
                timetable_id INTEGER NOT NULL,
                session_id INTEGER NOT NULL,
                FOREIGN KEY (timetable_id, session_id)
                    REFERENCES timetable_sessions (timetable_id, session_id)
            )",
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                date_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                site_name TEXT NOT NULL,
                site_facility TEXT NOT NULL,
                level INTEGER NOT NULL,
                instructor TEXT NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("creating schema")?;
        }
        Ok(())
    }

    /// Site, contact and namespaced facilities land in one transaction.
    pub async fn insert_site(&self, site: &Site) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO sites (site_id, name, timezone, tldc_approved) VALUES (?, ?, ?, ?)")
            .bind(site.site_id)
            .bind(&site.name)
            .bind(&site.timezone)
            .bind(site.tldc_approved)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting site {}", site.site_id))?;
        sqlx::query(
            "INSERT INTO contacts (site_id, address_line_1, address_line_2, post_code, post_town,
                                   country, telephone, website, latitude, longitude)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(site.site_id)
        .bind(&site.contact.address_line_1)
        .bind(&site.contact.address_line_2)
        .bind(&site.contact.post_code)
        .bind(&site.contact.post_town)
        .bind(&site.contact.country)
        .bind(&site.contact.telephone)
        .bind(&site.contact.website)
        .bind(&site.contact.latitude)
        .bind(&site.contact.longitude)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting contact for site {}", site.site_id))?;
        for facility in &site.facilities {
            sqlx::query(
                "INSERT INTO facilities (site_id, facility_id, name, length, tldc_approved)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(facility.key.site_id)
            .bind(facility.key.facility_id)
            .bind(&facility.name)
            .bind(facility.length)
            .bind(facility.tldc_approved)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting facility {}", facility.key))?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_sessions(&self, sessions: &[TimetableSession]) -> Result<()> {
        for session in sessions {
            sqlx::query(
                "INSERT INTO timetable_sessions (timetable_id, session_id, name, category, description)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(session.key.timetable_id)
            .bind(session.key.session_id)
            .bind(&session.name)
            .bind(&session.category)
            .bind(&session.description)
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting session {}", session.key))?;
        }
        Ok(())
    }

    pub async fn insert_timetable(&self, timetable: &Timetable) -> Result<()> {
        sqlx::query("INSERT INTO timetables (timetable_id, name, site_id) VALUES (?, ?, ?)")
            .bind(timetable.timetable_id)
            .bind(&timetable.name)
            .bind(timetable.site_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting timetable {}", timetable.timetable_id))?;
        Ok(())
    }

    pub async fn insert_entry(&self, entry: &TimetableEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO timetable_entries (entry_id, name, date_time, end_time, facility_name,
                                            instructor_name, level, is_cancelled, timetable_id, session_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.entry_id)
        .bind(&entry.name)
        .bind(entry.date_time)
        .bind(entry.end_time)
        .bind(&entry.facility_name)
        .bind(&entry.instructor_name)
        .bind(entry.level)
        .bind(entry.is_cancelled)
        .bind(entry.session.timetable_id)
        .bind(entry.session.session_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting entry {}", entry.entry_id))?;
        Ok(())
    }

    /// Non-cancelled entries starting at or after `now`, joined to their
    /// session, timetable and site. Duration and name filtering happen in
    /// [`project_events`].
    pub async fn entry_join_rows_from(&self, now: NaiveDateTime) -> Result<Vec<EntryJoinRow>> {
        let rows = sqlx::query(
            "SELECT e.name, s.description, e.date_time, e.end_time, e.facility_name,
                    e.level, e.instructor_name, st.name AS site_name
               FROM timetable_entries e
               JOIN timetable_sessions s
                 ON s.timetable_id = e.timetable_id AND s.session_id = e.session_id
               JOIN timetables t ON t.timetable_id = e.timetable_id
               JOIN sites st ON st.site_id = t.site_id
              WHERE e.is_cancelled = 0 AND e.date_time >= ?
              ORDER BY e.date_time ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("querying projection candidates")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(EntryJoinRow {
                name: row.try_get("name")?,
                description: row.try_get("description")?,
                date_time: row.try_get("date_time")?,
                end_time: row.try_get("end_time")?,
                facility_name: row.try_get("facility_name")?,
                level: row.try_get("level")?,
                instructor_name: row.try_get("instructor_name")?,
                site_name: row.try_get("site_name")?,
            });
        }
        Ok(out)
    }

    /// Replace the materialized projection with `events`.
    pub async fn replace_events(&self, events: &[Event]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM events").execute(&mut *tx).await?;
        for event in events {
            sqlx::query(
                "INSERT INTO events (name, description, date_time, end_time, site_name,
                                     site_facility, level, instructor)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.name)
            .bind(&event.description)
            .bind(event.date_time)
            .bind(event.end_time)
            .bind(&event.site_name)
            .bind(&event.site_facility)
            .bind(event.level)
            .bind(&event.instructor)
            .execute(&mut *tx)
            .await
            .context("inserting event row")?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event projection

/// One projection candidate: an entry joined to its session description and
/// owning site name.
#[derive(Debug, Clone)]
pub struct EntryJoinRow {
    pub name: String,
    pub description: String,
    pub date_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub facility_name: String,
    pub level: i64,
    pub instructor_name: String,
    pub site_name: String,
}

/// Filter candidates down to public events and strip HTML from the
/// descriptions. Pure; deterministic for a fixed candidate set.
pub fn project_events(rows: Vec<EntryJoinRow>) -> Vec<Event> {
    rows.into_iter()
        .filter(|row| {
            (row.end_time - row.date_time).num_seconds() <= MAX_EVENT_DURATION_SECS
                && !EXCLUDED_NAME_TERMS.iter().any(|term| row.name.contains(term))
        })
        .map(|row| Event {
            name: row.name,
            description: strip_html(&row.description),
            date_time: row.date_time,
            end_time: row.end_time,
            site_name: row.site_name,
            site_facility: row.facility_name,
            level: row.level,
            instructor: row.instructor_name,
        })
        .collect()
}

/// Materialize the event projection for `now`. Returns the row count.
pub async fn run_projection(store: &Store, now: NaiveDateTime) -> Result<usize> {
    let candidates = store.entry_join_rows_from(now).await?;
    let events = project_events(candidates);
    store.replace_events(&events).await?;
    Ok(events.len())
}

// ---------------------------------------------------------------------------
// Pipeline

/// A fetched timetable together with the site that referenced it. When two
/// sites reference the same timetable id, the last reference wins.
#[derive(Debug, Clone)]
pub struct TimetableFetch {
    pub site_id: i64,
    pub payload: TimetablePayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub sites: usize,
    pub facilities: usize,
    pub timetables: usize,
    pub sessions: usize,
    pub entries: usize,
    pub events: usize,
}

pub struct IngestPipeline {
    api: Arc<ApiClient>,
    store: Store,
}

impl IngestPipeline {
    pub fn new(api: ApiClient, store: Store) -> Self {
        Self {
            api: Arc::new(api),
            store,
        }
    }

    /// Run every stage in dependency order. Any fetch or validation error
    /// aborts the run; insert errors abort the remaining work of their
    /// stage with prior rows left committed.
    pub async fn run(&self, site_ids: &[i64], now: NaiveDateTime) -> Result<IngestSummary> {
        let started_at = now;

        let sites = self.fetch_sites(site_ids).await?;
        let facility_count: usize = sites.iter().map(|s| s.facilities.len()).sum();
        info!(sites = sites.len(), facilities = facility_count, "sites fetched");
        for site in &sites {
            self.store.insert_site(site).await?;
        }

        let timetables = self.fetch_timetables(&sites).await?;
        info!(timetables = timetables.len(), "timetables fetched");

        let sessions = collect_sessions(&timetables);
        self.store.insert_sessions(&sessions).await?;
        info!(sessions = sessions.len(), "sessions inserted");

        for fetch in &timetables {
            self.store
                .insert_timetable(&Timetable {
                    timetable_id: fetch.payload.id,
                    name: fetch.payload.name.clone(),
                    site_id: fetch.site_id,
                })
                .await?;
        }

        let timetable_ids: Vec<i64> = timetables.iter().map(|t| t.payload.id).collect();
        let entry_batches = self.fetch_entries(&timetable_ids, now.date()).await?;
        let mut entry_count = 0usize;
        for (timetable_id, payloads) in entry_batches {
            for payload in payloads {
                let entry = payload
                    .into_entry(timetable_id)
                    .with_context(|| format!("combining timestamps for timetable {timetable_id}"))?;
                self.store.insert_entry(&entry).await?;
                entry_count += 1;
            }
        }
        info!(entries = entry_count, "entries inserted");

        let events = run_projection(&self.store, now).await?;
        info!(events, "event projection materialized");

        Ok(IngestSummary {
            started_at,
            finished_at: Utc::now().naive_utc(),
            sites: sites.len(),
            facilities: facility_count,
            timetables: timetable_ids.len(),
            sessions: sessions.len(),
            entries: entry_count,
            events,
        })
    }

    /// Stage 1: fan-out fetch+validate of each configured site, joined
    /// all-of-N and restored to configured order.
    async fn fetch_sites(&self, site_ids: &[i64]) -> Result<Vec<Site>> {
        let mut tasks = JoinSet::new();
        for (idx, site_id) in site_ids.iter().copied().enumerate() {
            let api = Arc::clone(&self.api);
            tasks.spawn(async move { (idx, api.site(site_id).await) });
        }
        let mut slots: Vec<Option<Site>> = (0..site_ids.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (idx, result) = joined.context("site fetch task panicked")?;
            slots[idx] = Some(result?.into_site());
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Stage 2: fetch every timetable referenced by any site, keyed by
    /// timetable id with the last referencing site winning.
    async fn fetch_timetables(&self, sites: &[Site]) -> Result<Vec<TimetableFetch>> {
        let refs: Vec<(i64, i64)> = sites
            .iter()
            .flat_map(|site| site.timetable_refs.iter().map(|id| (site.site_id, *id)))
            .collect();

        let mut tasks = JoinSet::new();
        for (idx, (site_id, timetable_id)) in refs.iter().copied().enumerate() {
            let api = Arc::clone(&self.api);
            tasks.spawn(async move { (idx, site_id, api.timetable(timetable_id).await) });
        }
        let mut slots: Vec<Option<TimetableFetch>> = (0..refs.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (idx, site_id, result) = joined.context("timetable fetch task panicked")?;
            slots[idx] = Some(TimetableFetch {
                site_id,
                payload: result?,
            });
        }

        let mut order: Vec<i64> = Vec::new();
        let mut by_id: HashMap<i64, TimetableFetch> = HashMap::new();
        for fetch in slots.into_iter().flatten() {
            let id = fetch.payload.id;
            if !by_id.contains_key(&id) {
                order.push(id);
            }
            by_id.insert(id, fetch);
        }
        Ok(order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect())
    }

    /// Stage 5: two 7-day windows per timetable (from `today` and from
    /// `today + 7`), merged and de-duplicated by entry id so overlapping
    /// windows cannot violate store uniqueness.
    async fn fetch_entries(
        &self,
        timetable_ids: &[i64],
        today: NaiveDate,
    ) -> Result<Vec<(i64, Vec<EntryPayload>)>> {
        let next_week = today + chrono::Duration::days(7);
        let mut tasks = JoinSet::new();
        for (idx, timetable_id) in timetable_ids.iter().copied().enumerate() {
            let api = Arc::clone(&self.api);
            tasks.spawn(async move {
                let result = async {
                    let mut merged = api.timetable_entries(timetable_id, today).await?;
                    merged.extend(api.timetable_entries(timetable_id, next_week).await?);
                    Ok::<_, poolside_api::ApiError>(merged)
                }
                .await;
                (idx, timetable_id, result)
            });
        }
        let mut slots: Vec<Option<(i64, Vec<EntryPayload>)>> =
            (0..timetable_ids.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (idx, timetable_id, result) = joined.context("entry fetch task panicked")?;
            slots[idx] = Some((timetable_id, dedupe_entries_by_id(result?)));
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

/// Stage 3: flatten sessions across timetables in order and dedupe by raw
/// session id. The first occurrence wins and owns the namespaced key;
/// later duplicates are silently dropped.
pub fn collect_sessions(timetables: &[TimetableFetch]) -> Vec<TimetableSession> {
    let mut seen: HashSet<i64> = HashSet::new();
    let mut out = Vec::new();
    for fetch in timetables {
        for session in &fetch.payload.timetable_sessions {
            if seen.insert(session.id) {
                out.push(TimetableSession {
                    key: SessionKey {
                        timetable_id: fetch.payload.id,
                        session_id: session.id,
                    },
                    name: session.name.clone(),
                    category: session.timetable_session_category.name.clone(),
                    description: session.description.clone(),
                });
            }
        }
    }
    out
}

/// First occurrence wins across merged fetch windows.
pub fn dedupe_entries_by_id(entries: Vec<EntryPayload>) -> Vec<EntryPayload> {
    let mut seen: HashSet<i64> = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.id))
        .collect()
}

/// Convenience entry point wired to the environment: migrate, ingest,
/// project.
pub async fn run_ingest_from_env() -> Result<IngestSummary> {
    let config = IngestConfig::from_env()?;
    let store = Store::connect(&config.database_url).await?;
    store.migrate().await?;
    let pipeline = IngestPipeline::new(config.build_api_client()?, store);
    pipeline.run(&config.site_ids, Utc::now().naive_utc()).await
}
