//! Upstream activity-booking API client: endpoint URLs, response-envelope
//! unwrapping, and payload schema validation.

use async_trait::async_trait;
use chrono::NaiveDate;
use poolside_core::{
    combine_date_time, intensity_level, Contact, Facility, FacilityKey, SessionKey, Site,
    TimetableEntry, DEFAULT_TIMEZONE,
};
use poolside_storage::{CachedFetcher, Fetch, FetchError};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const CRATE_NAME: &str = "poolside-api";

/// Number of days each timetable-entries request spans.
pub const ENTRY_WINDOW_DAYS: i64 = 7;

// ---------------------------------------------------------------------------
// Payload shapes, mirroring the upstream contract. Unknown fields pass
// through unchecked; missing or mistyped required fields fail validation.

#[derive(Debug, Clone, Deserialize)]
pub struct ContactPayload {
    pub address_line_1: String,
    pub address_line_2: String,
    pub post_code: String,
    pub post_town: String,
    pub country: Option<String>,
    pub telephone: Option<String>,
    pub website: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub twitter: Option<String>,
    pub facebook: Option<String>,
    pub swimmers_guide_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacilityAliasPayload {
    pub id: i64,
    pub name: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacilityPayload {
    pub tldc_approved: bool,
    pub id: i64,
    pub length: Option<f64>,
    pub primary_name: String,
    pub facility_type: NamedRef,
    pub no_of_timetables: i64,
    pub facility_name_aliases: Vec<FacilityAliasPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SitePayload {
    pub id: i64,
    pub name: String,
    pub tldc_approved: bool,
    pub timezone: Option<String>,
    pub foreign_key: Option<String>,
    /// Required by the upstream contract; the content is not used.
    pub name_translations: Value,
    pub contact: ContactPayload,
    pub facilities: Vec<FacilityPayload>,
    pub timetables: Vec<NamedRef>,
    pub management: NamedRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstructorPayload {
    pub first_name: String,
    pub last_name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionPayload {
    pub description: String,
    pub foreign_key: Option<String>,
    pub id: i64,
    pub name: String,
    pub timetable_session_category: NamedRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimetablePayload {
    pub id: i64,
    pub name: String,
    pub instructors: Vec<InstructorPayload>,
    pub timetable_sessions: Vec<SessionPayload>,
    pub facilities: Vec<FacilityPayload>,
    pub levels: Vec<NamedRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntrySessionRef {
    pub id: i64,
    pub name: String,
    pub foreign_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryFacilityRef {
    pub id: i64,
    pub length: Option<f64>,
    pub primary_name: String,
    pub facility_type: NamedRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryPayload {
    pub id: i64,
    pub start_time: String,
    pub end_time: String,
    pub facility_name: String,
    pub date: String,
    pub day: String,
    pub term_type: NamedRef,
    pub is_cancelled: bool,
    pub timetable_session: EntrySessionRef,
    pub facility: EntryFacilityRef,
    pub ttentry_foreign_key: Option<String>,
    pub instructor: Option<InstructorPayload>,
    pub level: Option<NamedRef>,
}

// ---------------------------------------------------------------------------
// Validation

/// Which payload shape a validator was checking when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Site,
    Timetable,
    TimetableEntries,
}

impl std::fmt::Display for PayloadShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PayloadShape::Site => "site",
            PayloadShape::Timetable => "timetable",
            PayloadShape::TimetableEntries => "timetable entries",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{shape} payload failed validation: {source}")]
pub struct ValidationError {
    pub shape: PayloadShape,
    #[source]
    pub source: serde_json::Error,
}

pub fn validate_site(raw: Value) -> Result<SitePayload, ValidationError> {
    serde_json::from_value(raw).map_err(|source| ValidationError {
        shape: PayloadShape::Site,
        source,
    })
}

pub fn validate_timetable(raw: Value) -> Result<TimetablePayload, ValidationError> {
    serde_json::from_value(raw).map_err(|source| ValidationError {
        shape: PayloadShape::Timetable,
        source,
    })
}

pub fn validate_entries(raw: Value) -> Result<Vec<EntryPayload>, ValidationError> {
    serde_json::from_value(raw).map_err(|source| ValidationError {
        shape: PayloadShape::TimetableEntries,
        source,
    })
}

// ---------------------------------------------------------------------------
// Domain conversion

impl SitePayload {
    /// Namespace facilities under this site and apply the timezone default.
    pub fn into_site(self) -> Site {
        let site_id = self.id;
        Site {
            site_id,
            name: self.name,
            timezone: self.timezone.unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            tldc_approved: self.tldc_approved,
            contact: Contact {
                address_line_1: self.contact.address_line_1,
                address_line_2: self.contact.address_line_2,
                post_code: self.contact.post_code,
                post_town: self.contact.post_town,
                country: self.contact.country,
                telephone: self.contact.telephone,
                website: self.contact.website,
                latitude: self.contact.latitude,
                longitude: self.contact.longitude,
            },
            facilities: self
                .facilities
                .into_iter()
                .map(|f| Facility {
                    key: FacilityKey {
                        site_id,
                        facility_id: f.id,
                    },
                    name: f.primary_name,
                    length: f.length,
                    tldc_approved: f.tldc_approved,
                })
                .collect(),
            timetable_refs: self.timetables.into_iter().map(|t| t.id).collect(),
        }
    }
}

impl EntryPayload {
    /// Resolve the session reference against the owning timetable and
    /// derive the remaining fields.
    pub fn into_entry(self, timetable_id: i64) -> Result<TimetableEntry, chrono::ParseError> {
        Ok(TimetableEntry {
            entry_id: self.id,
            name: self.timetable_session.name.clone(),
            date_time: combine_date_time(&self.date, &self.start_time)?,
            end_time: combine_date_time(&self.date, &self.end_time)?,
            facility_name: self.facility_name,
            instructor_name: self
                .instructor
                .map(|i| i.display_name)
                .unwrap_or_default(),
            level: intensity_level(self.level.as_ref().map(|l| l.name.as_str())),
            is_cancelled: self.is_cancelled,
            session: SessionKey {
                timetable_id,
                session_id: self.timetable_session.id,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Client

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Unwraps the one-level `{ "response": ... }` envelope the upstream puts
/// around every body, before the payload reaches the cache or validation.
pub struct EnvelopeFetcher {
    inner: Box<dyn Fetch>,
}

impl EnvelopeFetcher {
    pub fn new(inner: Box<dyn Fetch>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Fetch for EnvelopeFetcher {
    async fn fetch(&self, url: &str) -> Result<Value, FetchError> {
        let mut outer = self.inner.fetch(url).await?;
        match outer.get_mut("response") {
            Some(payload) => Ok(payload.take()),
            None => Err(FetchError::Malformed {
                url: url.to_string(),
                detail: "missing \"response\" envelope".to_string(),
            }),
        }
    }
}

/// Typed client over the cached fetcher: builds endpoint URLs and
/// validates each payload shape.
pub struct ApiClient {
    fetcher: CachedFetcher,
    base_url: String,
    key: String,
}

impl ApiClient {
    pub fn new(fetcher: CachedFetcher, base_url: impl Into<String>, key: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.into(),
            fetcher,
        }
    }

    pub fn site_url(&self, site_id: i64) -> String {
        format!("{}/v1/sites/{}.json?key={}", self.base_url, site_id, self.key)
    }

    pub fn timetable_url(&self, timetable_id: i64) -> String {
        format!(
            "{}/v1/timetables/{}.json?key={}",
            self.base_url, timetable_id, self.key
        )
    }

    pub fn entries_url(&self, timetable_id: i64, from_date: NaiveDate) -> String {
        format!(
            "{}/v1/timetables/{}/timetable_entries.json?numberOfDays={}&fromDate={}&key={}",
            self.base_url,
            timetable_id,
            ENTRY_WINDOW_DAYS,
            from_date.format("%Y-%m-%d"),
            self.key
        )
    }

    pub async fn site(&self, site_id: i64) -> Result<SitePayload, ApiError> {
        let raw = self.fetcher.get_or_fetch(&self.site_url(site_id)).await?;
        Ok(validate_site(raw)?)
    }

    pub async fn timetable(&self, timetable_id: i64) -> Result<TimetablePayload, ApiError> {
        let raw = self
            .fetcher
            .get_or_fetch(&self.timetable_url(timetable_id))
            .await?;
        Ok(validate_timetable(raw)?)
    }

    pub async fn timetable_entries(
        &self,
        timetable_id: i64,
        from_date: NaiveDate,
    ) -> Result<Vec<EntryPayload>, ApiError> {
        let raw = self
            .fetcher
            .get_or_fetch(&self.entries_url(timetable_id, from_date))
            .await?;
        Ok(validate_entries(raw)?)
    }
}
