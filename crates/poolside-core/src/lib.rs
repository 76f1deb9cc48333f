//! Core domain model for Poolside: entities, composite keys, derivations.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "poolside-core";

/// Timezone applied when the upstream site payload carries none.
pub const DEFAULT_TIMEZONE: &str = "Europe/London";

/// Literal escape sequence the upstream embeds in level names, one per
/// intensity step. Kept encoded: HTML stripping must not decode it.
pub const INTENSITY_MARKER: &str = "&#x1F9E1";

/// Intensity level when the upstream level field is absent entirely.
pub const DEFAULT_INTENSITY: i64 = 2;

/// Facility ids are reused across unrelated sites; the composite key is
/// the only globally unique identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FacilityKey {
    pub site_id: i64,
    pub facility_id: i64,
}

/// Session ids are reused across unrelated timetables; namespaced likewise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub timetable_id: i64,
    pub session_id: i64,
}

impl std::fmt::Display for FacilityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.site_id, self.facility_id)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.timetable_id, self.session_id)
    }
}

/// A physical leisure location. Created once per ingest run, immutable
/// after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub site_id: i64,
    pub name: String,
    pub timezone: String,
    pub tldc_approved: bool,
    pub contact: Contact,
    pub facilities: Vec<Facility>,
    /// Timetable ids referenced by this site; payloads resolved later.
    pub timetable_refs: Vec<i64>,
}

/// 1:1 with a site. Geocoordinates are opaque strings upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub address_line_1: String,
    pub address_line_2: String,
    pub post_code: String,
    pub post_town: String,
    pub country: Option<String>,
    pub telephone: Option<String>,
    pub website: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

/// A bookable amenity within a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub key: FacilityKey,
    pub name: String,
    pub length: Option<f64>,
    pub tldc_approved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timetable {
    pub timetable_id: i64,
    pub name: String,
    pub site_id: i64,
}

/// A recurring class/activity definition, independent of occurrences.
/// Description may carry raw HTML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimetableSession {
    pub key: SessionKey,
    pub name: String,
    pub category: String,
    pub description: String,
}

/// One concrete scheduled occurrence of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimetableEntry {
    pub entry_id: i64,
    pub name: String,
    pub date_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub facility_name: String,
    pub instructor_name: String,
    pub level: i64,
    pub is_cancelled: bool,
    pub session: SessionKey,
}

/// Display-ready projection row derived from a timetable entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub description: String,
    pub date_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub site_name: String,
    pub site_facility: String,
    pub level: i64,
    pub instructor: String,
}

/// Derive the intensity level from the upstream level name.
///
/// Present field: count of embedded `&#x1F9E1` markers, zero included.
/// Absent field: [`DEFAULT_INTENSITY`]. No upper clamp.
pub fn intensity_level(level_name: Option<&str>) -> i64 {
    match level_name {
        Some(name) => name.matches(INTENSITY_MARKER).count() as i64,
        None => DEFAULT_INTENSITY,
    }
}

/// Naive HTML strip for display text: `&nbsp;` becomes a space, then any
/// `<...>` span is dropped. Deliberately not a parser and deliberately
/// leaves other entity references encoded.
pub fn strip_html(input: &str) -> String {
    let input = input.replace("&nbsp;", " ");
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Combine the upstream `date` and `start_time`/`end_time` strings into one
/// timestamp, the way the source data joins them with a `T`.
pub fn combine_date_time(date: &str, time: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    let joined = format!("{date}T{time}");
    NaiveDateTime::parse_from_str(&joined, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(&joined, "%Y-%m-%dT%H:%M"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intensity_counts_markers_when_field_present() {
        assert_eq!(intensity_level(Some("&#x1F9E1&#x1F9E1 Moderate")), 2);
        assert_eq!(intensity_level(Some("&#x1F9E1")), 1);
        assert_eq!(intensity_level(Some("&#x1F9E1&#x1F9E1&#x1F9E1 Intense")), 3);
    }

    #[test]
    fn intensity_zero_when_present_without_markers() {
        // Present-but-markerless is distinct from absent.
        assert_eq!(intensity_level(Some("Gentle")), 0);
    }

    #[test]
    fn intensity_defaults_when_field_absent() {
        assert_eq!(intensity_level(None), DEFAULT_INTENSITY);
    }

    #[test]
    fn strip_html_removes_tags_and_nbsp_only() {
        let html = "<p><span style=\"font-size: 11pt;\">Lane swimming session.&nbsp; \
                    No open water swimming available.</span></p>";
        assert_eq!(
            strip_html(html),
            "Lane swimming session.  No open water swimming available."
        );
    }

    #[test]
    fn strip_html_leaves_other_entities_encoded() {
        assert_eq!(strip_html("<b>&#x1F9E1</b> easy"), "&#x1F9E1 easy");
    }

    #[test]
    fn strip_html_passes_plain_text_through() {
        assert_eq!(strip_html("30 minute aqua class"), "30 minute aqua class");
    }

    #[test]
    fn combine_date_time_joins_date_and_time() {
        let ts = combine_date_time("2026-09-01", "07:30:00").unwrap();
        assert_eq!(ts.to_string(), "2026-09-01 07:30:00");
        let short = combine_date_time("2026-09-01", "07:30").unwrap();
        assert_eq!(short, ts);
    }

    #[test]
    fn composite_keys_distinguish_reused_raw_ids() {
        let a = FacilityKey { site_id: 1, facility_id: 7 };
        let b = FacilityKey { site_id: 2, facility_id: 7 };
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "1/7");

        let s = SessionKey { timetable_id: 4, session_id: 10 };
        let t = SessionKey { timetable_id: 5, session_id: 10 };
        assert_ne!(s, t);
    }
}
