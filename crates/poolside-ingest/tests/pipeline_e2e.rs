//! Full pipeline run against a fake upstream: two sites sharing a raw
//! facility id and a timetable, duplicate sessions, overlapping entry
//! windows, and the event projection over the result.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use poolside_api::{ApiClient, EnvelopeFetcher};
use poolside_ingest::{run_projection, IngestPipeline, Store};
use poolside_storage::{CachedFetcher, Fetch, FetchError, ResponseCache};
use serde_json::{json, Value};
use sqlx::Row;
use tempfile::tempdir;

const BASE: &str = "https://api.example.test";
const KEY: &str = "TESTKEY";
const TODAY: &str = "2026-09-01";
const NEXT_WEEK: &str = "2026-09-08";

struct FakeUpstream;

impl FakeUpstream {
    fn site_body(site_id: i64) -> Value {
        let (name, facility, timetables) = match site_id {
            1 => (
                "Hillcrest Leisure Centre",
                "Main Pool",
                json!([{"id": 40, "name": "Pool Programme"}, {"id": 41, "name": "Classes"}]),
            ),
            2 => (
                "Riverside Baths",
                "Teaching Pool",
                json!([{"id": 41, "name": "Classes"}]),
            ),
            _ => panic!("unexpected site {site_id}"),
        };
        json!({
            "id": site_id,
            "name": name,
            "tldc_approved": true,
            "timezone": null,
            "foreign_key": null,
            "name_translations": {},
            "contact": {
                "address_line_1": "1 Pool Lane",
                "address_line_2": "",
                "post_code": "AB1 2CD",
                "post_town": "Hilltown",
                "country": "United Kingdom",
                "telephone": null,
                "website": null,
                "latitude": null,
                "longitude": null,
                "twitter": null,
                "facebook": null,
                "swimmers_guide_id": null
            },
            // Raw facility id 7 is deliberately reused by both sites.
            "facilities": [{
                "tldc_approved": true,
                "id": 7,
                "length": 25.0,
                "primary_name": facility,
                "facility_type": {"id": 1, "name": "Pool"},
                "no_of_timetables": 1,
                "facility_name_aliases": []
            }],
            "timetables": timetables,
            "management": {"id": 3, "name": "Hilltown Council"}
        })
    }

    fn session(id: i64, name: &str) -> Value {
        json!({
            "description": format!("<p>{name}&nbsp;class</p>"),
            "foreign_key": null,
            "id": id,
            "name": name,
            "timetable_session_category": {"id": 1, "name": "Classes"}
        })
    }

    fn timetable_body(timetable_id: i64) -> Value {
        let sessions = match timetable_id {
            40 => json!([
                Self::session(10, "Aqua Aerobics"),
                Self::session(11, "Lane Swimming"),
            ]),
            41 => json!([
                // Raw session id 10 already appeared under timetable 40.
                Self::session(10, "Aqua Aerobics"),
                Self::session(12, "Pool Closed"),
                Self::session(13, "Aqua Marathon"),
                Self::session(14, "Aqua Zumba"),
            ]),
            _ => panic!("unexpected timetable {timetable_id}"),
        };
        json!({
            "id": timetable_id,
            "name": format!("Timetable {timetable_id}"),
            "instructors": [],
            "timetable_sessions": sessions,
            "facilities": [],
            "levels": []
        })
    }

    fn entry(
        id: i64,
        date: &str,
        start: &str,
        end: &str,
        session_id: i64,
        session_name: &str,
        cancelled: bool,
    ) -> Value {
        json!({
            "id": id,
            "start_time": start,
            "end_time": end,
            "facility_name": "Main Pool",
            "date": date,
            "day": "Tuesday",
            "term_type": {"id": 1, "name": "Standard"},
            "is_cancelled": cancelled,
            "timetable_session": {"id": session_id, "name": session_name, "foreign_key": null},
            "facility": {
                "id": 7,
                "length": 25.0,
                "primary_name": "Main Pool",
                "facility_type": {"id": 1, "name": "Pool"}
            },
            "ttentry_foreign_key": null,
            "level": {"id": 2, "name": "&#x1F9E1&#x1F9E1 Moderate"}
        })
    }

    fn entries_body(timetable_id: i64, from_date: &str) -> Value {
        match (timetable_id, from_date) {
            (40, TODAY) => json!([
                Self::entry(900, TODAY, "07:30:00", "08:00:00", 10, "Aqua Aerobics", false),
                Self::entry(901, TODAY, "08:00:00", "08:45:00", 11, "Lane Swimming", false),
                Self::entry(902, TODAY, "12:00:00", "12:30:00", 10, "Aqua Aerobics", true),
            ]),
            (40, NEXT_WEEK) => json!([
                // Entry 900 appears in both windows.
                Self::entry(900, TODAY, "07:30:00", "08:00:00", 10, "Aqua Aerobics", false),
                Self::entry(903, NEXT_WEEK, "07:30:00", "08:00:00", 10, "Aqua Aerobics", false),
            ]),
            (41, TODAY) => json!([
                Self::entry(910, TODAY, "10:00:00", "10:30:00", 12, "Pool Closed", false),
                Self::entry(911, TODAY, "09:00:00", "10:30:00", 13, "Aqua Marathon", false),
                Self::entry(912, TODAY, "09:00:00", "09:45:00", 14, "Aqua Zumba", false),
            ]),
            (41, NEXT_WEEK) => json!([]),
            _ => panic!("unexpected entries request {timetable_id} {from_date}"),
        }
    }
}

#[async_trait]
impl Fetch for FakeUpstream {
    async fn fetch(&self, url: &str) -> Result<Value, FetchError> {
        let body = if let Some(rest) = url.split("/v1/sites/").nth(1) {
            let id: i64 = rest.split(".json").next().unwrap().parse().unwrap();
            Self::site_body(id)
        } else if url.contains("/timetable_entries.json") {
            let id: i64 = url
                .split("/v1/timetables/")
                .nth(1)
                .unwrap()
                .split('/')
                .next()
                .unwrap()
                .parse()
                .unwrap();
            let from = url.split("fromDate=").nth(1).unwrap().split('&').next().unwrap();
            Self::entries_body(id, from)
        } else if let Some(rest) = url.split("/v1/timetables/").nth(1) {
            let id: i64 = rest.split(".json").next().unwrap().parse().unwrap();
            Self::timetable_body(id)
        } else {
            return Err(FetchError::Malformed {
                url: url.to_string(),
                detail: "unroutable test url".to_string(),
            });
        };
        Ok(json!({ "response": body }))
    }
}

fn fixed_now() -> NaiveDateTime {
    NaiveDateTime::parse_from_str("2026-09-01 06:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
}

async fn run_pipeline(store: &Store) -> poolside_ingest::IngestSummary {
    let cache_dir = tempdir().expect("tempdir");
    let api = ApiClient::new(
        CachedFetcher::new(
            ResponseCache::new(cache_dir.path()),
            Box::new(EnvelopeFetcher::new(Box::new(FakeUpstream))),
        ),
        BASE,
        KEY,
    );
    let pipeline = IngestPipeline::new(api, store.clone());
    pipeline.run(&[1, 2], fixed_now()).await.expect("pipeline run")
}

#[tokio::test]
async fn full_run_populates_store_and_projection() {
    let store = Store::connect_in_memory().await.expect("store");
    store.migrate().await.expect("migrate");

    let summary = run_pipeline(&store).await;
    assert_eq!(summary.sites, 2);
    assert_eq!(summary.facilities, 2);
    assert_eq!(summary.timetables, 2);
    assert_eq!(summary.sessions, 5);
    // 4 for timetable 40 after cross-window dedup, 3 for timetable 41.
    assert_eq!(summary.entries, 7);
    assert_eq!(summary.events, 3);

    // Both sites keep their own facility row despite the shared raw id.
    let facilities = sqlx::query("SELECT site_id, name FROM facilities ORDER BY site_id")
        .fetch_all(store.pool())
        .await
        .expect("facilities");
    assert_eq!(facilities.len(), 2);
    assert_eq!(facilities[0].get::<String, _>("name"), "Main Pool");
    assert_eq!(facilities[1].get::<String, _>("name"), "Teaching Pool");

    // Timetable 41 is referenced by both sites; the later site wins.
    let owner: i64 = sqlx::query("SELECT site_id FROM timetables WHERE timetable_id = 41")
        .fetch_one(store.pool())
        .await
        .expect("timetable 41")
        .get("site_id");
    assert_eq!(owner, 2);

    // Raw session 10 keeps its first key; timetable 41 gets only its own.
    let session_keys: Vec<(i64, i64)> =
        sqlx::query("SELECT timetable_id, session_id FROM timetable_sessions ORDER BY timetable_id, session_id")
            .fetch_all(store.pool())
            .await
            .expect("sessions")
            .into_iter()
            .map(|row| (row.get("timetable_id"), row.get("session_id")))
            .collect();
    assert_eq!(session_keys, vec![(40, 10), (40, 11), (41, 12), (41, 13), (41, 14)]);
}

#[tokio::test]
async fn projection_applies_duration_name_and_cancellation_filters() {
    let store = Store::connect_in_memory().await.expect("store");
    store.migrate().await.expect("migrate");
    run_pipeline(&store).await;

    let events = sqlx::query("SELECT name, description, instructor, level FROM events ORDER BY date_time")
        .fetch_all(store.pool())
        .await
        .expect("events");

    // Excluded: 901 Lane Swimming (name), 902 (cancelled), 910 Pool Closed
    // (name), 911 Aqua Marathon (90 minutes).
    let names: Vec<String> = events.iter().map(|row| row.get("name")).collect();
    assert_eq!(names, vec!["Aqua Aerobics", "Aqua Zumba", "Aqua Aerobics"]);

    // Description comes from the session, HTML stripped.
    assert_eq!(events[0].get::<String, _>("description"), "Aqua Aerobics class");
    assert_eq!(events[0].get::<String, _>("instructor"), "");
    assert_eq!(events[0].get::<i64, _>("level"), 2);
}

#[tokio::test]
async fn rerunning_projection_replaces_rows() {
    let store = Store::connect_in_memory().await.expect("store");
    store.migrate().await.expect("migrate");
    run_pipeline(&store).await;

    let count = run_projection(&store, fixed_now()).await.expect("reprojection");
    assert_eq!(count, 3);
    let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM events")
        .fetch_one(store.pool())
        .await
        .expect("count")
        .get("n");
    assert_eq!(total, 3);

    // A later cutoff drops past occurrences without touching the entries.
    let later = NaiveDateTime::parse_from_str("2026-09-02 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
    let count = run_projection(&store, later).await.expect("later projection");
    assert_eq!(count, 1);
}
