//! Core domain model, report wire schemas and archive-name ordering for compatdb.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "compatdb-core";

/// Schema-version tag stored next to every report payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportVersion {
    V1,
    V2,
}

impl ReportVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportVersion::V1 => "V1",
            ReportVersion::V2 => "V2",
        }
    }
}

impl fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown report version {0:?}")]
pub struct UnknownReportVersion(pub String);

impl FromStr for ReportVersion {
    type Err = UnknownReportVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "V1" => Ok(ReportVersion::V1),
            "V2" => Ok(ReportVersion::V2),
            other => Err(UnknownReportVersion(other.to_string())),
        }
    }
}

/// Persisted ingestion progress marker. One logical record, upserted in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub last_processed_file: String,
    pub last_processed_time: DateTime<Utc>,
    /// Last time a cycle ran without finding a newer archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_time: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(last_processed_file: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            last_processed_file: last_processed_file.into(),
            last_processed_time: at,
            last_checked_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: Uuid,
    pub app_id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub reports: Vec<Uuid>,
}

impl Game {
    pub fn new(app_id: impl Into<String>, title: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            title,
            reports: Vec::new(),
        }
    }
}

/// Stored report: the decoded record as it arrived, plus its schema tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub data: Map<String, JsonValue>,
    pub report_version: ReportVersion,
}

impl Report {
    pub fn new(data: Map<String, JsonValue>, report_version: ReportVersion) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            report_version,
        }
    }
}

/// Flat first-generation report record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportV1 {
    pub app_id: JsonValue,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub timestamp: Option<JsonValue>,
    #[serde(default)]
    pub rating: Option<JsonValue>,
    #[serde(default)]
    pub os: Option<JsonValue>,
    #[serde(default)]
    pub notes: Option<JsonValue>,
    #[serde(default)]
    pub gpu_driver: Option<JsonValue>,
    #[serde(default)]
    pub specs: Option<JsonValue>,
    #[serde(default)]
    pub proton_version: Option<JsonValue>,
    #[serde(default)]
    pub cpu: Option<JsonValue>,
    #[serde(default)]
    pub duration: Option<JsonValue>,
    #[serde(default)]
    pub gpu: Option<JsonValue>,
    #[serde(default)]
    pub kernel: Option<JsonValue>,
    #[serde(default)]
    pub ram: Option<JsonValue>,
    #[serde(default)]
    pub tweaks: Option<Map<String, JsonValue>>,
}

/// Second-generation report record with nested app identity and system info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportV2 {
    pub app: AppRefV2,
    #[serde(default)]
    pub responses: Option<Map<String, JsonValue>>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub system_info: SystemInfoV2,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppRefV2 {
    #[serde(default)]
    pub steam: SteamRefV2,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SteamRefV2 {
    #[serde(default)]
    pub app_id: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfoV2 {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub gpu: Option<String>,
    #[serde(default)]
    pub gpu_driver: Option<String>,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub ram: Option<String>,
}

/// Access to the fields the ingestion path needs, independent of schema generation.
pub trait WireReport {
    const VERSION: ReportVersion;

    fn app_id_value(&self) -> Option<&JsonValue>;
    fn title(&self) -> Option<&str>;
}

impl WireReport for ReportV1 {
    const VERSION: ReportVersion = ReportVersion::V1;

    fn app_id_value(&self) -> Option<&JsonValue> {
        Some(&self.app_id)
    }

    fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }
}

impl WireReport for ReportV2 {
    const VERSION: ReportVersion = ReportVersion::V2;

    fn app_id_value(&self) -> Option<&JsonValue> {
        self.app.steam.app_id.as_ref()
    }

    fn title(&self) -> Option<&str> {
        self.app.title.as_deref()
    }
}

/// A decoded record together with the exact JSON object it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReport<T> {
    pub record: T,
    pub raw: Map<String, JsonValue>,
}

/// Result of schema detection over one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportBatch {
    V1(Vec<ParsedReport<ReportV1>>),
    V2(Vec<ParsedReport<ReportV2>>),
}

impl ReportBatch {
    pub fn version(&self) -> ReportVersion {
        match self {
            ReportBatch::V1(_) => ReportVersion::V1,
            ReportBatch::V2(_) => ReportVersion::V2,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ReportBatch::V1(items) => items.len(),
            ReportBatch::V2(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stored-payload paths compared when recognising an already-ingested V2 report.
pub static DEDUP_KEY_PATHS: [&[&str]; 9] = [
    &["app", "steam", "appId"],
    &["app", "title"],
    &["timestamp"],
    &["systemInfo", "cpu"],
    &["systemInfo", "gpu"],
    &["systemInfo", "gpuDriver"],
    &["systemInfo", "kernel"],
    &["systemInfo", "os"],
    &["systemInfo", "ram"],
];

/// The 9-field tuple identifying a V2 report. `None` means the field is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupKey {
    values: [Option<JsonValue>; 9],
}

impl DedupKey {
    pub fn from_payload(data: &Map<String, JsonValue>) -> Self {
        Self {
            values: DEDUP_KEY_PATHS.map(|path| json_at(data, path).cloned()),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static [&'static str], Option<&JsonValue>)> + '_ {
        DEDUP_KEY_PATHS
            .iter()
            .copied()
            .zip(self.values.iter().map(Option::as_ref))
    }

    pub fn matches(&self, data: &Map<String, JsonValue>) -> bool {
        self.fields()
            .all(|(path, expected)| json_at(data, path) == expected)
    }
}

pub fn json_at<'a>(data: &'a Map<String, JsonValue>, path: &[&str]) -> Option<&'a JsonValue> {
    let (first, rest) = path.split_first()?;
    let mut current = data.get(*first)?;
    for key in rest {
        current = current.get(*key)?;
    }
    Some(current)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppIdError {
    #[error("report has no application identifier")]
    Missing,
    #[error("application identifier has unsupported type: {0}")]
    UnsupportedType(String),
    #[error("application identifier {0:?} is not a finite number")]
    NotFinite(String),
    #[error("application identifier {0:?} does not fit a 64-bit integer")]
    OutOfRange(String),
}

fn scientific_notation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[-+]?[0-9]*\.?[0-9]+([eE][-+]?[0-9]+)?$").expect("static regex compiles")
    })
}

/// Stable game key for a raw application identifier.
///
/// Numeric-looking identifiers (including `4.56e8`) are parsed as floats and
/// truncated, so `"4.56e8"` and `"456000000"` map to the same key. Plain
/// integers are kept exact; values outside the `i64` range are rejected.
pub fn normalize_app_id(raw: &JsonValue) -> Result<String, AppIdError> {
    let text = match raw {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Null => return Err(AppIdError::Missing),
        other => return Err(AppIdError::UnsupportedType(other.to_string())),
    };
    if text.is_empty() {
        return Err(AppIdError::Missing);
    }

    if !scientific_notation_regex().is_match(&text) {
        return Ok(text);
    }

    if let Ok(int) = text.parse::<i64>() {
        return Ok(int.to_string());
    }

    // 2^63; the cast below saturates past it.
    const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;
    let parsed: f64 = text
        .parse()
        .map_err(|_| AppIdError::NotFinite(text.clone()))?;
    if !parsed.is_finite() {
        return Err(AppIdError::NotFinite(text));
    }
    let truncated = parsed.trunc();
    if truncated >= I64_BOUND || truncated < -I64_BOUND {
        return Err(AppIdError::OutOfRange(text));
    }
    Ok(format!("{}", truncated as i64))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("malformed archive name {name:?}: {reason}")]
    MalformedName { name: String, reason: &'static str },
}

fn archive_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([a-zA-Z]{3})(\d{1,2})_(\d{4})").expect("static regex compiles")
    })
}

fn month_from_abbrev(abbrev: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = abbrev.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|idx| idx as u32 + 1)
}

/// Point-in-time date encoded in an archive name such as `reports_nov1_2019.tar.gz`.
pub fn archive_date(name: &str) -> Result<NaiveDate, ResolveError> {
    let malformed = |reason| ResolveError::MalformedName {
        name: name.to_string(),
        reason,
    };
    let caps = archive_date_regex()
        .captures(name)
        .ok_or_else(|| malformed("no date token found"))?;

    let month = month_from_abbrev(&caps[1]).ok_or_else(|| malformed("unknown month"))?;
    let day: u32 = caps[2].parse().map_err(|_| malformed("invalid day"))?;
    let year: i32 = caps[3].parse().map_err(|_| malformed("invalid year"))?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| malformed("not a calendar date"))
}

/// True iff `earlier` resolves to a strictly earlier date than `later`.
///
/// Unparsable names never precede anything; the failure is logged.
pub fn archive_precedes(earlier: &str, later: &str) -> bool {
    let a = match archive_date(earlier) {
        Ok(date) => date,
        Err(err) => {
            warn!(error = %err, "cannot order archive");
            return false;
        }
    };
    let b = match archive_date(later) {
        Ok(date) => date,
        Err(err) => {
            warn!(error = %err, "cannot order archive");
            return false;
        }
    };
    a < b
}

/// Drops names without a date token and sorts the rest oldest first.
pub fn sort_archives(names: Vec<String>) -> Vec<String> {
    let mut dated: Vec<(NaiveDate, String)> = names
        .into_iter()
        .filter_map(|name| match archive_date(&name) {
            Ok(date) => Some((date, name)),
            Err(err) => {
                warn!(error = %err, "skipping archive without usable date");
                None
            }
        })
        .collect();
    dated.sort_by(|(da, na), (db, nb)| match da.cmp(db) {
        Ordering::Equal => na.cmp(nb),
        other => other,
    });
    dated.into_iter().map(|(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn archive_dates_parse_short_and_long_days() {
        assert_eq!(
            archive_date("reports/reports_nov1_2019.tar.gz").unwrap(),
            NaiveDate::from_ymd_opt(2019, 11, 1).unwrap()
        );
        assert_eq!(
            archive_date("reports_oct31_2019.tar.gz").unwrap(),
            NaiveDate::from_ymd_opt(2019, 10, 31).unwrap()
        );
        assert_eq!(
            archive_date("reports/reports_Dec1_2023.tar.gz").unwrap(),
            NaiveDate::from_ymd_opt(2023, 12, 1).unwrap()
        );
    }

    #[test]
    fn malformed_names_are_rejected() {
        assert!(matches!(
            archive_date("reports/latest.tar.gz"),
            Err(ResolveError::MalformedName { .. })
        ));
        assert!(matches!(
            archive_date("reports/reports_feb30_2020.tar.gz"),
            Err(ResolveError::MalformedName { .. })
        ));
        assert!(matches!(
            archive_date("reports/reports_xyz1_2020.tar.gz"),
            Err(ResolveError::MalformedName { .. })
        ));
    }

    #[test]
    fn ordering_is_strict_and_transitive() {
        let a = "reports/reports_oct31_2019.tar.gz";
        let b = "reports/reports_nov1_2019.tar.gz";
        let c = "reports/reports_jan1_2020.tar.gz";

        assert!(archive_precedes(a, b));
        assert!(!archive_precedes(b, a));
        assert!(archive_precedes(b, c));
        assert!(archive_precedes(a, c));
        assert!(!archive_precedes(b, b));
    }

    #[test]
    fn unparsable_names_never_precede() {
        let good = "reports/reports_nov1_2019.tar.gz";
        assert!(!archive_precedes("", good));
        assert!(!archive_precedes(good, "reports/latest.tar.gz"));
        assert!(!archive_precedes("garbage", "other"));
    }

    #[test]
    fn sort_drops_undated_and_orders_oldest_first() {
        let sorted = sort_archives(vec![
            "reports/reports_jan1_2020.tar.gz".into(),
            "reports/readme.tar.gz".into(),
            "reports/reports_nov1_2019.tar.gz".into(),
            "reports/reports_may12_2021.tar.gz".into(),
        ]);
        assert_eq!(
            sorted,
            vec![
                "reports/reports_nov1_2019.tar.gz",
                "reports/reports_jan1_2020.tar.gz",
                "reports/reports_may12_2021.tar.gz",
            ]
        );
    }

    #[test]
    fn app_ids_in_scientific_notation_collapse_to_integer_text() {
        assert_eq!(normalize_app_id(&json!("4.56e8")).unwrap(), "456000000");
        assert_eq!(normalize_app_id(&json!("456000000")).unwrap(), "456000000");
        assert_eq!(normalize_app_id(&json!(4.56e8)).unwrap(), "456000000");
        assert_eq!(normalize_app_id(&json!(730)).unwrap(), "730");
        assert_eq!(normalize_app_id(&json!("1.5E3")).unwrap(), "1500");
    }

    #[test]
    fn app_ids_beyond_i64_are_rejected_instead_of_merged() {
        assert_eq!(
            normalize_app_id(&json!("1e30")),
            Err(AppIdError::OutOfRange("1e30".to_string()))
        );
        assert_eq!(
            normalize_app_id(&json!("-1e30")),
            Err(AppIdError::OutOfRange("-1e30".to_string()))
        );
        assert_eq!(
            normalize_app_id(&json!("99999999999999999999")),
            Err(AppIdError::OutOfRange("99999999999999999999".to_string()))
        );
        assert!(matches!(
            normalize_app_id(&json!(1e300)),
            Err(AppIdError::OutOfRange(_))
        ));
    }

    #[test]
    fn large_integer_app_ids_stay_exact() {
        assert_eq!(
            normalize_app_id(&json!("9007199254740993")).unwrap(),
            "9007199254740993"
        );
        assert_eq!(
            normalize_app_id(&json!(9_223_372_036_854_775_807_i64)).unwrap(),
            "9223372036854775807"
        );
        assert_eq!(normalize_app_id(&json!("4.56e8")).unwrap(), "456000000");
    }

    #[test]
    fn non_numeric_app_ids_pass_through() {
        assert_eq!(
            normalize_app_id(&json!("non-steam-42")).unwrap(),
            "non-steam-42"
        );
        assert_eq!(normalize_app_id(&JsonValue::Null), Err(AppIdError::Missing));
        assert_eq!(normalize_app_id(&json!("  ")), Err(AppIdError::Missing));
        assert!(matches!(
            normalize_app_id(&json!(["730"])),
            Err(AppIdError::UnsupportedType(_))
        ));
    }

    #[test]
    fn dedup_key_matches_on_all_nine_fields() {
        let stored = obj(json!({
            "app": { "steam": { "appId": "730" }, "title": "Counter-Strike 2" },
            "timestamp": 1700000000,
            "responses": { "verdict": "yes" },
            "systemInfo": {
                "cpu": "AMD Ryzen 7",
                "gpu": "RX 6800",
                "gpuDriver": "Mesa 23.2",
                "kernel": "6.5.0",
                "os": "Arch Linux",
                "ram": "32 GB"
            }
        }));
        let key = DedupKey::from_payload(&stored);
        assert!(key.matches(&stored));

        let mut different_responses = stored.clone();
        different_responses.insert("responses".into(), json!({ "verdict": "no" }));
        assert!(key.matches(&different_responses));

        let mut different_kernel = stored.clone();
        different_kernel.insert(
            "systemInfo".into(),
            json!({
                "cpu": "AMD Ryzen 7",
                "gpu": "RX 6800",
                "gpuDriver": "Mesa 23.2",
                "kernel": "6.6.1",
                "os": "Arch Linux",
                "ram": "32 GB"
            }),
        );
        assert!(!key.matches(&different_kernel));
    }

    #[test]
    fn report_version_round_trips_through_text() {
        assert_eq!("V2".parse::<ReportVersion>().unwrap(), ReportVersion::V2);
        assert_eq!(ReportVersion::V1.to_string(), "V1");
        assert!("v3".parse::<ReportVersion>().is_err());
    }
}
