use std::collections::HashMap;
use std::io::Read;

use assert_matches::assert_matches;
use chrono::NaiveDate;
use flate2::read::GzDecoder;

use covid_forecast::config::{FeedConfig, FeedShape};
use covid_forecast::domain::{Granularity, Source};
use covid_forecast::error::PipelineError;
use covid_forecast::feeds::FeedClient;
use covid_forecast::ingest::{
    encode_archive, ingest_feed, parse_current_json, parse_long_csv, parse_timeline_json,
    parse_wide_csv,
};

#[derive(Default)]
struct MockFeeds {
    payloads: HashMap<String, Vec<u8>>,
}

impl MockFeeds {
    fn with(mut self, location: &str, payload: &str) -> Self {
        self.payloads
            .insert(location.to_string(), payload.as_bytes().to_vec());
        self
    }
}

impl FeedClient for MockFeeds {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, PipelineError> {
        self.payloads
            .get(location)
            .cloned()
            .ok_or_else(|| PipelineError::FeedStatus {
                location: location.to_string(),
                status: 404,
                message: "not found".to_string(),
            })
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

const TIMELINE: &str = r#"{"locations":[{
    "country":"Italy","country_code":"IT","province":"",
    "coordinates":{"latitude":"41.87","longitude":12.56},
    "timelines":{
        "confirmed":{"timeline":{"2020-03-01T00:00:00Z":1694,"2020-03-02T00:00:00Z":2036}},
        "deaths":{"timeline":{"2020-03-01T00:00:00Z":34,"2020-03-02T00:00:00Z":52}}
    }
}]}"#;

const CURRENT: &str = r#"{"locations":[
    {"country":"US","state":"New York","county":"Kings",
     "coordinates":{"latitude":"40.63","longitude":"-73.95"},
     "last_updated":"2020-04-07T14:00:00Z",
     "latest":{"confirmed":18000,"deaths":-2}}
]}"#;

#[test]
fn timeline_json_yields_row_per_date() {
    let rows = parse_timeline_json("jhu-api", &Source::Jhu, TIMELINE.as_bytes()).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].date, date(2020, 3, 1));
    assert_eq!(rows[0].confirmed, 1694);
    assert_eq!(rows[1].deaths, 52);
    assert_eq!(rows[0].province, None);
    assert_eq!(rows[0].country_code.as_deref(), Some("IT"));
    assert_eq!(rows[0].latitude, Some(41.87));
}

#[test]
fn current_payload_is_not_a_timeline() {
    let result = parse_timeline_json("jhu-api", &Source::Jhu, CURRENT.as_bytes());
    assert_matches!(
        result,
        Err(PipelineError::MalformedFeed { message, .. }) if message.contains("not a timeline")
    );
}

#[test]
fn timeline_length_mismatch_is_malformed() {
    let payload = TIMELINE.replace(r#","2020-03-02T00:00:00Z":52"#, "");
    let result = parse_timeline_json("jhu-api", &Source::Jhu, payload.as_bytes());
    assert_matches!(result, Err(PipelineError::MalformedFeed { .. }));
}

#[test]
fn current_json_uses_update_date() {
    let rows = parse_current_json("csbs", &Source::Csbs, CURRENT.as_bytes()).unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.date, date(2020, 4, 7));
    assert!(row.updated_at.is_some());
    assert_eq!(row.province.as_deref(), Some("New York"));
    assert_eq!(row.county.as_deref(), Some("Kings"));
    assert_eq!(row.deaths, 0);
    assert_eq!(row.longitude, Some(-73.95));
}

#[test]
fn long_csv_with_aliases_and_feed_country() {
    let payload = "\
date,state,fips,cases,deaths
2020-03-01,Washington,53,11,1
2020-03-02,Washington,53,,2
";
    let rows =
        parse_long_csv("nyt-states", &Source::NyTimes, Some("United States"), payload.as_bytes())
            .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].country, "United States");
    assert_eq!(rows[0].province.as_deref(), Some("Washington"));
    assert_eq!(rows[0].fips, Some(53));
    assert_eq!(rows[1].confirmed, 0);
}

#[test]
fn long_csv_rejects_bad_values() {
    let payload = "date,country,cases,deaths\n2020-03-01,Italy,many,0\n";
    let result = parse_long_csv("feed", &Source::Jhu, None, payload.as_bytes());
    assert_matches!(
        result,
        Err(PipelineError::MalformedFeed { message, .. }) if message.contains("row 2")
    );

    let missing = "date,country,deaths\n2020-03-01,Italy,0\n";
    assert_matches!(
        parse_long_csv("feed", &Source::Jhu, None, missing.as_bytes()),
        Err(PipelineError::MalformedFeed { .. })
    );
}

const WIDE_CONFIRMED: &str = "\
Province/State,Country/Region,Lat,Long,1/22/20,1/23/20
Hubei,China,30.97,112.27,444,444
,Italy,41.87,12.56,0,2
";

const WIDE_DEATHS: &str = "\
Province/State,Country/Region,Lat,Long,1/22/20,1/23/20
Hubei,China,30.97,112.27,17,17
,Italy,41.87,12.56,0,0
";

#[test]
fn wide_csv_joins_metric_files() {
    let rows = parse_wide_csv(
        "jhu-global",
        &Source::Jhu,
        WIDE_CONFIRMED.as_bytes(),
        WIDE_DEATHS.as_bytes(),
        None,
    )
    .unwrap();
    assert_eq!(rows.len(), 4);
    let hubei = rows
        .iter()
        .find(|row| row.province.as_deref() == Some("Hubei") && row.date == date(2020, 1, 22))
        .unwrap();
    assert_eq!(hubei.confirmed, 444);
    assert_eq!(hubei.deaths, 17);
    let italy = rows
        .iter()
        .find(|row| row.country == "Italy" && row.date == date(2020, 1, 23))
        .unwrap();
    assert_eq!(italy.province, None);
    assert_eq!(italy.confirmed, 2);
}

#[test]
fn wide_csv_duplicate_deaths_row_keeps_the_last() {
    let deaths = "\
Province/State,Country/Region,Lat,Long,1/22/20,1/23/20
Hubei,China,30.97,112.27,17,17
,Italy,41.87,12.56,0,0
,Italy,41.87,12.56,1,3
";
    let rows = parse_wide_csv(
        "jhu-global",
        &Source::Jhu,
        WIDE_CONFIRMED.as_bytes(),
        deaths.as_bytes(),
        None,
    )
    .unwrap();
    assert_eq!(rows.len(), 4);
    let italy = rows
        .iter()
        .find(|row| row.country == "Italy" && row.date == date(2020, 1, 23))
        .unwrap();
    assert_eq!(italy.deaths, 3);
}

#[test]
fn long_csv_drops_out_of_range_fips() {
    let csv = "date,state,fips,cases,deaths\n2020-03-01,Washington,-53,1,0\n";
    let rows = parse_long_csv("nyt-states", &Source::NyTimes, Some("United States"), csv.as_bytes())
        .unwrap();
    assert_eq!(rows[0].fips, None);
}

#[test]
fn wide_csv_without_deaths_row_is_malformed() {
    let deaths = "Province/State,Country/Region,Lat,Long,1/22/20,1/23/20\n,Italy,41.87,12.56,0,0\n";
    let result = parse_wide_csv(
        "jhu-global",
        &Source::Jhu,
        WIDE_CONFIRMED.as_bytes(),
        deaths.as_bytes(),
        None,
    );
    assert_matches!(result, Err(PipelineError::MalformedFeed { .. }));
}

fn current_feed(history: Option<&str>) -> FeedConfig {
    FeedConfig {
        name: "csbs".to_string(),
        source: Source::Csbs,
        shape: FeedShape::CurrentJson,
        url: "current.json".to_string(),
        deaths_url: None,
        recovered_url: None,
        history: history.map(str::to_string),
        country: Some("United States".to_string()),
        granularities: vec![Granularity::County],
    }
}

#[test]
fn archive_replays_as_history() {
    let feeds = MockFeeds::default().with("current.json", CURRENT);
    let table = ingest_feed(&feeds, &current_feed(None)).unwrap();
    let archive = encode_archive(&table.rows).unwrap();

    let mut csv = String::new();
    GzDecoder::new(archive.as_slice())
        .read_to_string(&mut csv)
        .unwrap();
    assert!(csv.starts_with("date,country,country_code"));

    let mut feeds = MockFeeds::default().with("current.json", CURRENT);
    feeds
        .payloads
        .insert("csbs_2020_04_06.csv".to_string(), csv.replace("2020-04-07", "2020-04-06").into_bytes());
    let merged = ingest_feed(&feeds, &current_feed(Some("csbs_2020_04_06.csv"))).unwrap();
    assert_eq!(merged.rows.len(), 2);
    assert_eq!(merged.rows[0].date, date(2020, 4, 6));
    assert_eq!(merged.rows[1].date, date(2020, 4, 7));
    assert_eq!(merged.rows[0].county.as_deref(), Some("Kings"));
}

#[test]
fn missing_feed_fails_the_ingest() {
    let feeds = MockFeeds::default();
    assert_matches!(
        ingest_feed(&feeds, &current_feed(None)),
        Err(PipelineError::FeedStatus { status: 404, .. })
    );
}
