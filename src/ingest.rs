use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{FeedConfig, FeedShape};
use crate::domain::{Granularity, RawObservation, Source, non_empty};
use crate::error::PipelineError;
use crate::feeds::FeedClient;

static WIDE_DATE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}/\d{1,2}/\d{2,4}$").expect("static pattern"));

#[derive(Debug, Clone)]
pub struct RawTable {
    pub feed: String,
    pub source: Source,
    pub granularities: Vec<Granularity>,
    pub rows: Vec<RawObservation>,
}

#[derive(Debug, Clone, Default)]
pub struct RawSources {
    pub tables: BTreeMap<String, RawTable>,
}

impl RawSources {
    pub fn row_count(&self) -> usize {
        self.tables.values().map(|table| table.rows.len()).sum()
    }
}

pub fn ingest_feeds<F: FeedClient + ?Sized>(
    client: &F,
    feeds: &[FeedConfig],
) -> Result<RawSources, PipelineError> {
    let mut sources = RawSources::default();
    for feed in feeds {
        let table = ingest_feed(client, feed)?;
        info!(feed = %feed.name, rows = table.rows.len(), "ingested feed");
        sources.tables.insert(feed.name.clone(), table);
    }
    Ok(sources)
}

pub fn ingest_feed<F: FeedClient + ?Sized>(
    client: &F,
    feed: &FeedConfig,
) -> Result<RawTable, PipelineError> {
    let payload = client.fetch(&feed.url)?;
    let mut rows = match feed.shape {
        FeedShape::TimelineJson => parse_timeline_json(&feed.name, &feed.source, &payload)?,
        FeedShape::CurrentJson => {
            let mut current = parse_current_json(&feed.name, &feed.source, &payload)?;
            match &feed.history {
                Some(history) => {
                    let past = client.fetch(history)?;
                    let mut rows =
                        parse_long_csv(history, &feed.source, feed.country.as_deref(), &past)?;
                    rows.append(&mut current);
                    rows
                }
                None => current,
            }
        }
        FeedShape::LongCsv => {
            parse_long_csv(&feed.name, &feed.source, feed.country.as_deref(), &payload)?
        }
        FeedShape::WideCsv => {
            let deaths_url = feed.deaths_url.as_deref().ok_or_else(|| {
                PipelineError::InvalidConfig(format!("feed {} has no deaths_url", feed.name))
            })?;
            let deaths = client.fetch(deaths_url)?;
            let recovered = match &feed.recovered_url {
                Some(url) => Some(client.fetch(url)?),
                None => None,
            };
            parse_wide_csv(
                &feed.name,
                &feed.source,
                &payload,
                &deaths,
                recovered.as_deref(),
            )?
        }
    };
    if rows.is_empty() {
        return Err(PipelineError::malformed(&feed.name, "feed returned no rows"));
    }
    for row in rows.iter_mut().filter(|row| row.country.is_empty()) {
        match &feed.country {
            Some(country) => row.country = country.clone(),
            None => {
                return Err(PipelineError::malformed(
                    &feed.name,
                    format!("row dated {} has no country", row.date),
                ));
            }
        }
    }
    Ok(RawTable {
        feed: feed.name.clone(),
        source: feed.source.clone(),
        granularities: feed.granularities.clone(),
        rows,
    })
}

#[derive(Debug, Deserialize)]
struct LocationsPayload {
    locations: Vec<Location>,
}

#[derive(Debug, Deserialize)]
struct Location {
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    province: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    county: Option<String>,
    #[serde(default)]
    coordinates: Option<Coordinates>,
    #[serde(default)]
    last_updated: Option<String>,
    #[serde(default)]
    latest: Option<Latest>,
    #[serde(default)]
    timelines: Option<Timelines>,
}

#[derive(Debug, Deserialize)]
struct Coordinates {
    #[serde(default)]
    latitude: Option<Numeric>,
    #[serde(default)]
    longitude: Option<Numeric>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(f64),
    Text(String),
}

impl Numeric {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Numeric::Number(value) => Some(*value),
            Numeric::Text(text) => text.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Latest {
    confirmed: i64,
    deaths: i64,
    #[serde(default)]
    recovered: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Timelines {
    confirmed: Timeline,
    deaths: Timeline,
    #[serde(default)]
    recovered: Option<Timeline>,
}

#[derive(Debug, Deserialize)]
struct Timeline {
    #[serde(default)]
    timeline: BTreeMap<String, i64>,
}

impl Location {
    fn base_row(&self, source: &Source, date: NaiveDate) -> RawObservation {
        let mut row = RawObservation::new(
            source.clone(),
            self.country.clone().unwrap_or_default().trim(),
            date,
        );
        row.country_code = self.country_code.clone().and_then(non_empty);
        row.province = self
            .province
            .clone()
            .and_then(non_empty)
            .or_else(|| self.state.clone().and_then(non_empty));
        row.county = self.county.clone().and_then(non_empty);
        if let Some(coordinates) = &self.coordinates {
            row.latitude = coordinates.latitude.as_ref().and_then(Numeric::as_f64);
            row.longitude = coordinates.longitude.as_ref().and_then(Numeric::as_f64);
        }
        row
    }
}

fn parse_locations(feed: &str, payload: &[u8]) -> Result<Vec<Location>, PipelineError> {
    let parsed: LocationsPayload = serde_json::from_slice(payload)
        .map_err(|err| PipelineError::malformed(feed, err.to_string()))?;
    if parsed.locations.is_empty() {
        return Err(PipelineError::malformed(feed, "no locations in payload"));
    }
    Ok(parsed.locations)
}

pub fn parse_timeline_json(
    feed: &str,
    source: &Source,
    payload: &[u8],
) -> Result<Vec<RawObservation>, PipelineError> {
    let locations = parse_locations(feed, payload)?;
    let mut rows = Vec::new();
    for location in &locations {
        let timelines = location
            .timelines
            .as_ref()
            .ok_or_else(|| PipelineError::malformed(feed, "not a timeline payload"))?;
        let confirmed = &timelines.confirmed.timeline;
        let deaths = &timelines.deaths.timeline;
        if confirmed.len() != deaths.len() {
            return Err(PipelineError::malformed(
                feed,
                format!(
                    "timeline length mismatch for {}: {} confirmed vs {} deaths",
                    location.country.as_deref().unwrap_or("?"),
                    confirmed.len(),
                    deaths.len()
                ),
            ));
        }
        let recovered = timelines.recovered.as_ref().map(|t| &t.timeline);
        for (stamp, confirmed_value) in confirmed {
            let date = parse_date(stamp)
                .ok_or_else(|| PipelineError::malformed(feed, format!("bad date {stamp}")))?;
            let deaths_value = deaths.get(stamp).ok_or_else(|| {
                PipelineError::malformed(feed, format!("deaths timeline lacks {stamp}"))
            })?;
            let mut row = location.base_row(source, date);
            row.confirmed = clamp_count(feed, *confirmed_value);
            row.deaths = clamp_count(feed, *deaths_value);
            row.recovered = recovered
                .and_then(|timeline| timeline.get(stamp))
                .map(|value| clamp_count(feed, *value));
            rows.push(row);
        }
    }
    Ok(rows)
}

pub fn parse_current_json(
    feed: &str,
    source: &Source,
    payload: &[u8],
) -> Result<Vec<RawObservation>, PipelineError> {
    let locations = parse_locations(feed, payload)?;
    let mut rows = Vec::with_capacity(locations.len());
    for location in &locations {
        let stamp = location
            .last_updated
            .as_deref()
            .ok_or_else(|| PipelineError::malformed(feed, "location without last_updated"))?;
        let updated_at = parse_timestamp(stamp)
            .ok_or_else(|| PipelineError::malformed(feed, format!("bad timestamp {stamp}")))?;
        let latest = location
            .latest
            .as_ref()
            .ok_or_else(|| PipelineError::malformed(feed, "location without latest counts"))?;
        let mut row = location.base_row(source, updated_at.date_naive());
        row.updated_at = Some(updated_at);
        row.confirmed = clamp_count(feed, latest.confirmed);
        row.deaths = clamp_count(feed, latest.deaths);
        row.recovered = latest.recovered.map(|value| clamp_count(feed, value));
        rows.push(row);
    }
    Ok(rows)
}

const DATE_ALIASES: &[&str] = &["date"];
const COUNTRY_ALIASES: &[&str] = &["country", "country/region", "country_region"];
const CODE_ALIASES: &[&str] = &["country_code", "iso2", "iso_a2"];
const PROVINCE_ALIASES: &[&str] = &["province", "state", "province/state", "province_state"];
const COUNTY_ALIASES: &[&str] = &["county", "admin2"];
const FIPS_ALIASES: &[&str] = &["fips"];
const LAT_ALIASES: &[&str] = &["lat", "latitude"];
const LON_ALIASES: &[&str] = &["lon", "long", "long_", "longitude"];
const CONFIRMED_ALIASES: &[&str] = &["confirmed", "cases"];
const DEATHS_ALIASES: &[&str] = &["deaths"];
const RECOVERED_ALIASES: &[&str] = &["recovered"];
const UPDATED_ALIASES: &[&str] = &["updated_at", "last_updated"];

struct Columns {
    headers: Vec<String>,
}

impl Columns {
    fn new(headers: &csv::StringRecord) -> Self {
        Self {
            headers: headers
                .iter()
                .map(|header| header.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    fn find(&self, aliases: &[&str]) -> Option<usize> {
        aliases
            .iter()
            .find_map(|alias| self.headers.iter().position(|header| header == alias))
    }

    fn require(&self, feed: &str, aliases: &[&str]) -> Result<usize, PipelineError> {
        self.find(aliases)
            .ok_or_else(|| PipelineError::malformed(feed, format!("missing column {}", aliases[0])))
    }
}

fn field(record: &csv::StringRecord, index: Option<usize>) -> Option<String> {
    index
        .and_then(|i| record.get(i))
        .map(str::to_string)
        .and_then(non_empty)
}

pub fn parse_long_csv(
    feed: &str,
    source: &Source,
    default_country: Option<&str>,
    payload: &[u8],
) -> Result<Vec<RawObservation>, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(payload);
    let headers = reader
        .headers()
        .map_err(|err| PipelineError::malformed(feed, err.to_string()))?
        .clone();
    let columns = Columns::new(&headers);
    let date_col = columns.require(feed, DATE_ALIASES)?;
    let confirmed_col = columns.require(feed, CONFIRMED_ALIASES)?;
    let deaths_col = columns.require(feed, DEATHS_ALIASES)?;
    let country_col = columns.find(COUNTRY_ALIASES);
    if country_col.is_none() && default_country.is_none() {
        return Err(PipelineError::malformed(
            feed,
            "no country column and no feed-level country",
        ));
    }
    let code_col = columns.find(CODE_ALIASES);
    let province_col = columns.find(PROVINCE_ALIASES);
    let county_col = columns.find(COUNTY_ALIASES);
    let fips_col = columns.find(FIPS_ALIASES);
    let lat_col = columns.find(LAT_ALIASES);
    let lon_col = columns.find(LON_ALIASES);
    let recovered_col = columns.find(RECOVERED_ALIASES);
    let updated_col = columns.find(UPDATED_ALIASES);

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|err| PipelineError::malformed(feed, err.to_string()))?;
        let at = |message: String| PipelineError::malformed(feed, format!("row {}: {message}", line + 2));

        let raw_date = record.get(date_col).unwrap_or_default();
        let date = parse_date(raw_date).ok_or_else(|| at(format!("bad date {raw_date:?}")))?;
        let country = field(&record, country_col)
            .or_else(|| default_country.map(str::to_string))
            .ok_or_else(|| at("empty country".to_string()))?;

        let mut row = RawObservation::new(source.clone(), country, date);
        row.country_code = field(&record, code_col);
        row.province = field(&record, province_col);
        row.county = field(&record, county_col);
        row.fips = parse_optional_number(field(&record, fips_col))
            .map_err(|value| at(format!("bad fips {value:?}")))?
            .and_then(|value| fips_code(feed, value));
        row.latitude = parse_optional_number(field(&record, lat_col))
            .map_err(|value| at(format!("bad latitude {value:?}")))?;
        row.longitude = parse_optional_number(field(&record, lon_col))
            .map_err(|value| at(format!("bad longitude {value:?}")))?;
        row.confirmed = parse_count(feed, record.get(confirmed_col).unwrap_or_default())
            .map_err(|value| at(format!("bad confirmed count {value:?}")))?;
        row.deaths = parse_count(feed, record.get(deaths_col).unwrap_or_default())
            .map_err(|value| at(format!("bad deaths count {value:?}")))?;
        row.recovered = match field(&record, recovered_col) {
            Some(value) => Some(
                parse_count(feed, &value).map_err(|value| at(format!("bad recovered {value:?}")))?,
            ),
            None => None,
        };
        row.updated_at = field(&record, updated_col).and_then(|value| parse_timestamp(&value));
        rows.push(row);
    }
    Ok(rows)
}

type WideKey = (String, Option<String>, Option<String>);

struct WideTable {
    rows: Vec<WideRow>,
}

struct WideRow {
    key: WideKey,
    country_code: Option<String>,
    fips: Option<u32>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    values: Vec<(NaiveDate, u64)>,
}

fn read_wide(feed: &str, payload: &[u8]) -> Result<WideTable, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(payload);
    let headers = reader
        .headers()
        .map_err(|err| PipelineError::malformed(feed, err.to_string()))?
        .clone();
    let columns = Columns::new(&headers);
    let country_col = columns.require(feed, COUNTRY_ALIASES)?;
    let province_col = columns.find(PROVINCE_ALIASES);
    let county_col = columns.find(COUNTY_ALIASES);
    let code_col = columns.find(CODE_ALIASES);
    let fips_col = columns.find(FIPS_ALIASES);
    let lat_col = columns.find(LAT_ALIASES);
    let lon_col = columns.find(LON_ALIASES);

    let date_columns = headers
        .iter()
        .enumerate()
        .filter(|(_, header)| WIDE_DATE_HEADER.is_match(header.trim()))
        .map(|(index, header)| {
            parse_date(header.trim())
                .map(|date| (index, date))
                .ok_or_else(|| PipelineError::malformed(feed, format!("bad date header {header}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if date_columns.is_empty() {
        return Err(PipelineError::malformed(feed, "no date columns"));
    }

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|err| PipelineError::malformed(feed, err.to_string()))?;
        let at = |message: String| PipelineError::malformed(feed, format!("row {}: {message}", line + 2));
        let country = field(&record, Some(country_col)).ok_or_else(|| at("empty country".to_string()))?;
        let values = date_columns
            .iter()
            .map(|(index, date)| {
                let raw = record.get(*index).unwrap_or_default();
                parse_count(feed, raw)
                    .map(|count| (*date, count))
                    .map_err(|value| at(format!("bad count {value:?} on {date}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(WideRow {
            key: (
                country,
                field(&record, province_col),
                field(&record, county_col),
            ),
            country_code: field(&record, code_col),
            fips: parse_optional_number(field(&record, fips_col))
                .map_err(|value| at(format!("bad fips {value:?}")))?
                .and_then(|value| fips_code(feed, value)),
            latitude: parse_optional_number(field(&record, lat_col))
                .map_err(|value| at(format!("bad latitude {value:?}")))?,
            longitude: parse_optional_number(field(&record, lon_col))
                .map_err(|value| at(format!("bad longitude {value:?}")))?,
            values,
        });
    }
    Ok(WideTable { rows })
}

fn index_wide(feed: &str, table: WideTable) -> HashMap<WideKey, HashMap<NaiveDate, u64>> {
    let mut index = HashMap::with_capacity(table.rows.len());
    for row in table.rows {
        let key = row.key.clone();
        if index.insert(row.key, row.values.into_iter().collect()).is_some() {
            warn!(
                feed,
                country = %key.0,
                province = ?key.1,
                county = ?key.2,
                "duplicate wide row, keeping the last one"
            );
        }
    }
    index
}

pub fn parse_wide_csv(
    feed: &str,
    source: &Source,
    confirmed: &[u8],
    deaths: &[u8],
    recovered: Option<&[u8]>,
) -> Result<Vec<RawObservation>, PipelineError> {
    let confirmed = read_wide(feed, confirmed)?;
    let deaths = index_wide(feed, read_wide(feed, deaths)?);
    let recovered = match recovered {
        Some(payload) => Some(index_wide(feed, read_wide(feed, payload)?)),
        None => None,
    };

    let mut rows = Vec::new();
    for wide in confirmed.rows {
        let death_values = deaths.get(&wide.key).ok_or_else(|| {
            PipelineError::malformed(
                feed,
                format!("no deaths row for {}/{:?}", wide.key.0, wide.key.1),
            )
        })?;
        let recovered_values = recovered.as_ref().and_then(|index| index.get(&wide.key));
        for (date, confirmed_count) in &wide.values {
            let deaths_count = death_values.get(date).ok_or_else(|| {
                PipelineError::malformed(feed, format!("deaths lack {date} for {}", wide.key.0))
            })?;
            let mut row = RawObservation::new(source.clone(), wide.key.0.clone(), *date);
            row.province = wide.key.1.clone();
            row.county = wide.key.2.clone();
            row.country_code = wide.country_code.clone();
            row.fips = wide.fips;
            row.latitude = wide.latitude;
            row.longitude = wide.longitude;
            row.confirmed = *confirmed_count;
            row.deaths = *deaths_count;
            row.recovered = recovered_values.and_then(|values| values.get(date).copied());
            rows.push(row);
        }
    }
    Ok(rows)
}

const ARCHIVE_HEADER: [&str; 12] = [
    "date",
    "country",
    "country_code",
    "province",
    "county",
    "fips",
    "lat",
    "lon",
    "confirmed",
    "deaths",
    "recovered",
    "updated_at",
];

pub fn encode_archive(rows: &[RawObservation]) -> Result<Vec<u8>, PipelineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(ARCHIVE_HEADER)
        .map_err(|err| PipelineError::Encode(err.to_string()))?;
    for row in rows {
        let opt = |value: &Option<String>| value.clone().unwrap_or_default();
        let num = |value: Option<f64>| value.map(|v| v.to_string()).unwrap_or_default();
        writer
            .write_record([
                row.date.format("%Y-%m-%d").to_string(),
                row.country.clone(),
                opt(&row.country_code),
                opt(&row.province),
                opt(&row.county),
                row.fips.map(|f| f.to_string()).unwrap_or_default(),
                num(row.latitude),
                num(row.longitude),
                row.confirmed.to_string(),
                row.deaths.to_string(),
                row.recovered.map(|r| r.to_string()).unwrap_or_default(),
                row.updated_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ])
            .map_err(|err| PipelineError::Encode(err.to_string()))?;
    }
    let csv_bytes = writer
        .into_inner()
        .map_err(|err| PipelineError::Encode(err.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&csv_bytes)
        .map_err(|err| PipelineError::Encode(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| PipelineError::Encode(err.to_string()))
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    if value.contains('/') {
        let parts: Vec<&str> = value.split('/').collect();
        if parts.len() == 3 && parts[2].len() == 2 {
            return NaiveDate::parse_from_str(value, "%m/%d/%y").ok();
        }
        return NaiveDate::parse_from_str(value, "%m/%d/%Y").ok();
    }
    parse_timestamp(value).map(|stamp| stamp.date_naive())
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|stamp| stamp.with_timezone(&Utc))
}

fn parse_optional_number(value: Option<String>) -> Result<Option<f64>, String> {
    match value {
        Some(text) => text
            .replace(',', "")
            .parse::<f64>()
            .ok()
            .filter(|number| number.is_finite())
            .map(Some)
            .ok_or(text),
        None => Ok(None),
    }
}

fn parse_count(feed: &str, value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    let number = trimmed
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
        .ok_or_else(|| trimmed.to_string())?;
    Ok(clamp_count(feed, number.round() as i64))
}

pub fn fips_code(feed: &str, value: f64) -> Option<u32> {
    let whole = value.round();
    match u32::try_from(whole as i64) {
        Ok(code) if whole == value => Some(code),
        _ => {
            warn!(feed, fips = value, "fips code out of range, ignoring it");
            None
        }
    }
}

fn clamp_count(feed: &str, value: i64) -> u64 {
    if value < 0 {
        warn!(feed, value, "negative count reported, clamping to zero");
        return 0;
    }
    value as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2020, 3, 9).unwrap();
        assert_eq!(parse_date("2020-03-09"), Some(expected));
        assert_eq!(parse_date("3/9/20"), Some(expected));
        assert_eq!(parse_date("03/09/2020"), Some(expected));
        assert_eq!(parse_date("2020-03-09T12:30:00Z"), Some(expected));
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn counts_clamp_and_reject() {
        assert_eq!(parse_count("t", ""), Ok(0));
        assert_eq!(parse_count("t", "1,204"), Ok(1204));
        assert_eq!(parse_count("t", "-3"), Ok(0));
        assert_eq!(parse_count("t", "12.0"), Ok(12));
        assert!(parse_count("t", "n/a").is_err());
    }

    #[test]
    fn fips_codes_reject_out_of_range() {
        assert_eq!(fips_code("t", 36047.0), Some(36047));
        assert_eq!(fips_code("t", -1.0), None);
        assert_eq!(fips_code("t", 5.0e10), None);
        assert_eq!(fips_code("t", 36047.5), None);
    }
}
