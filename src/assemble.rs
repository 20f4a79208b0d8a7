use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::backfill::EntitySeries;
use crate::display::{BucketScale, DisplayConfig, hover_text};
use crate::domain::{EntityRef, GeoInfo, Granularity};
use crate::error::PipelineError;
use crate::forecast::EntityForecast;

pub const DATE_TEXT_FORMAT: &str = "%m/%d/%y";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterRecord {
    pub entity_id: u32,
    pub entity: String,
    pub granularity: Granularity,
    pub country: String,
    pub province: Option<String>,
    pub county: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub population: Option<u64>,
    pub date: NaiveDate,
    pub date_text: String,
    pub forecast: bool,
    pub confirmed: f64,
    pub deaths: f64,
    pub confirmed_upper: Option<f64>,
    pub confirmed_lower: Option<f64>,
    pub deaths_upper: Option<f64>,
    pub deaths_lower: Option<f64>,
    pub recovered: Option<u64>,
    pub new_confirmed: f64,
    pub new_deaths: f64,
    pub per_capita_confirmed: Option<f64>,
    pub per_capita_deaths: Option<f64>,
    pub mortality_rate: Option<f64>,
    pub confirmed_size: f64,
    pub confirmed_color: String,
    pub confirmed_bucket: String,
    pub deaths_size: f64,
    pub deaths_color: String,
    pub deaths_bucket: String,
    pub text_confirmed: String,
    pub text_deaths: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityLabel {
    pub entity_id: u32,
    pub name: String,
    pub granularity: Granularity,
    pub latitude: f64,
    pub longitude: f64,
    pub population: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct MasterDataset {
    pub records: Vec<MasterRecord>,
    pub labels: Vec<EntityLabel>,
}

impl MasterDataset {
    pub fn entity_count(&self) -> usize {
        self.labels.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DraftRow {
    date: NaiveDate,
    forecast: bool,
    confirmed: f64,
    deaths: f64,
    confirmed_upper: Option<f64>,
    confirmed_lower: Option<f64>,
    deaths_upper: Option<f64>,
    deaths_lower: Option<f64>,
    recovered: Option<u64>,
}

impl DraftRow {
    fn clamped(mut self) -> Self {
        let floor = |value: f64| value.max(0.0);
        self.confirmed = floor(self.confirmed);
        self.deaths = floor(self.deaths);
        self.confirmed_upper = self.confirmed_upper.map(floor);
        self.confirmed_lower = self.confirmed_lower.map(floor);
        self.deaths_upper = self.deaths_upper.map(floor);
        self.deaths_lower = self.deaths_lower.map(floor);
        self
    }

    fn accumulate(&mut self, other: &DraftRow) {
        let add = |a: Option<f64>, b: Option<f64>| Some(a? + b?);
        self.confirmed += other.confirmed;
        self.deaths += other.deaths;
        self.confirmed_upper = add(self.confirmed_upper, other.confirmed_upper);
        self.confirmed_lower = add(self.confirmed_lower, other.confirmed_lower);
        self.deaths_upper = add(self.deaths_upper, other.deaths_upper);
        self.deaths_lower = add(self.deaths_lower, other.deaths_lower);
        self.recovered = match (self.recovered, other.recovered) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
    }
}

struct Draft {
    info: GeoInfo,
    rows: Vec<DraftRow>,
}

pub fn assemble(
    series: &[EntitySeries],
    forecasts: &[EntityForecast],
    worldwide: Option<&GeoInfo>,
    display: &DisplayConfig,
) -> Result<MasterDataset, PipelineError> {
    let mut drafts: BTreeMap<EntityRef, Draft> = BTreeMap::new();
    for entity in series {
        let rows = entity
            .points
            .iter()
            .map(|point| DraftRow {
                date: point.date,
                forecast: false,
                confirmed: point.confirmed as f64,
                deaths: point.deaths as f64,
                confirmed_upper: None,
                confirmed_lower: None,
                deaths_upper: None,
                deaths_lower: None,
                recovered: point.recovered,
            })
            .collect();
        drafts.insert(
            entity.entity.clone(),
            Draft {
                info: entity.info.clone(),
                rows,
            },
        );
    }
    if drafts.is_empty() {
        return Err(PipelineError::EmptyDataset(
            "no entity series to assemble".to_string(),
        ));
    }

    for forecast in forecasts {
        let Some(draft) = drafts.get_mut(&forecast.entity) else {
            warn!(entity = %forecast.entity, "forecast without observed series, skipped");
            continue;
        };
        draft.rows.extend(forecast.rows.iter().map(|row| {
            DraftRow {
                date: row.date,
                forecast: true,
                confirmed: row.confirmed,
                deaths: row.deaths,
                confirmed_upper: Some(row.confirmed_upper),
                confirmed_lower: Some(row.confirmed_lower),
                deaths_upper: Some(row.deaths_upper),
                deaths_lower: Some(row.deaths_lower),
                recovered: None,
            }
        }));
    }
    for draft in drafts.values_mut() {
        for row in &mut draft.rows {
            *row = row.clamped();
        }
        draft.rows.sort_by_key(|row| (row.forecast, row.date));
    }

    if let Some(info) = worldwide
        && let Some(rows) = worldwide_rows(&drafts)
    {
        drafts.insert(
            EntityRef::Worldwide,
            Draft {
                info: info.clone(),
                rows,
            },
        );
    }

    let ids = rank_entities(&drafts);
    let scales = Scales::new(&drafts, display);

    let mut records = Vec::new();
    let mut labels = Vec::with_capacity(drafts.len());
    for (entity, draft) in &drafts {
        let entity_id = ids[entity];
        let name = entity.display_name();
        labels.push(EntityLabel {
            entity_id,
            name: name.clone(),
            granularity: entity.granularity(),
            latitude: draft.info.latitude,
            longitude: draft.info.longitude,
            population: draft.info.population,
        });
        let mut previous: Option<&DraftRow> = None;
        for row in &draft.rows {
            records.push(build_record(entity, entity_id, &name, &draft.info, row, previous, &scales));
            previous = Some(row);
        }
    }
    records.sort_by(|a, b| {
        a.entity_id
            .cmp(&b.entity_id)
            .then(a.date.cmp(&b.date))
    });
    labels.sort_by_key(|label| label.entity_id);

    info!(
        entities = labels.len(),
        rows = records.len(),
        "assembled master dataset"
    );
    Ok(MasterDataset { records, labels })
}

fn worldwide_rows(drafts: &BTreeMap<EntityRef, Draft>) -> Option<Vec<DraftRow>> {
    let mut sums: BTreeMap<(bool, NaiveDate), DraftRow> = BTreeMap::new();
    let countries = drafts
        .iter()
        .filter(|(entity, _)| entity.granularity() == Granularity::Country);
    let mut any = false;
    for (_, draft) in countries {
        any = true;
        for row in &draft.rows {
            sums.entry((row.forecast, row.date))
                .and_modify(|sum| sum.accumulate(row))
                .or_insert(*row);
        }
    }
    any.then(|| sums.into_values().collect())
}

fn rank_entities(drafts: &BTreeMap<EntityRef, Draft>) -> BTreeMap<EntityRef, u32> {
    let mut ranking: Vec<(&EntityRef, f64)> = drafts
        .iter()
        .map(|(entity, draft)| {
            let latest = draft
                .rows
                .iter()
                .filter(|row| !row.forecast)
                .max_by_key(|row| row.date)
                .map_or(0.0, |row| row.confirmed);
            (entity, latest)
        })
        .collect();
    ranking.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranking
        .into_iter()
        .enumerate()
        .map(|(id, (entity, _))| (entity.clone(), id as u32))
        .collect()
}

struct Scales {
    cases: BucketScale,
    deaths: BucketScale,
}

impl Scales {
    fn new(drafts: &BTreeMap<EntityRef, Draft>, display: &DisplayConfig) -> Self {
        let observed: Vec<&DraftRow> = drafts
            .iter()
            .filter(|(entity, _)| **entity != EntityRef::Worldwide)
            .flat_map(|(_, draft)| draft.rows.iter().filter(|row| !row.forecast))
            .collect();
        let confirmed: Vec<f64> = observed.iter().map(|row| row.confirmed).collect();
        let deaths: Vec<f64> = observed.iter().map(|row| row.deaths).collect();
        Self {
            cases: BucketScale::from_values(
                &confirmed,
                &display.quantiles,
                &display.sizes,
                &display.case_colors,
            ),
            deaths: BucketScale::from_values(
                &deaths,
                &display.quantiles,
                &display.sizes,
                &display.death_colors,
            ),
        }
    }
}

fn build_record(
    entity: &EntityRef,
    entity_id: u32,
    name: &str,
    info: &GeoInfo,
    row: &DraftRow,
    previous: Option<&DraftRow>,
    scales: &Scales,
) -> MasterRecord {
    let daily = |current: f64, prior: Option<f64>| match prior {
        Some(prior) => (current - prior).max(0.0),
        None => current,
    };
    let per_capita = |value: f64| {
        info.population
            .filter(|population| *population > 0)
            .map(|population| value / population as f64)
    };
    let case_bucket = scales.cases.bucket(row.confirmed);
    let death_bucket = scales.deaths.bucket(row.deaths);

    MasterRecord {
        entity_id,
        entity: name.to_string(),
        granularity: entity.granularity(),
        country: entity.country().unwrap_or(name).to_string(),
        province: entity.region().map(str::to_string),
        county: entity.county().map(str::to_string),
        latitude: info.latitude,
        longitude: info.longitude,
        population: info.population,
        date: row.date,
        date_text: row.date.format(DATE_TEXT_FORMAT).to_string(),
        forecast: row.forecast,
        confirmed: row.confirmed,
        deaths: row.deaths,
        confirmed_upper: row.confirmed_upper,
        confirmed_lower: row.confirmed_lower,
        deaths_upper: row.deaths_upper,
        deaths_lower: row.deaths_lower,
        recovered: row.recovered,
        new_confirmed: daily(row.confirmed, previous.map(|prior| prior.confirmed)),
        new_deaths: daily(row.deaths, previous.map(|prior| prior.deaths)),
        per_capita_confirmed: per_capita(row.confirmed),
        per_capita_deaths: per_capita(row.deaths),
        mortality_rate: (row.confirmed > 0.0).then(|| row.deaths / row.confirmed),
        confirmed_size: scales.cases.size(case_bucket),
        confirmed_color: scales.cases.color(case_bucket).to_string(),
        confirmed_bucket: scales.cases.label(case_bucket).to_string(),
        deaths_size: scales.deaths.size(death_bucket),
        deaths_color: scales.deaths.color(death_bucket).to_string(),
        deaths_bucket: scales.deaths.label(death_bucket).to_string(),
        text_confirmed: hover_text(name, "Cases", row.confirmed, row.forecast),
        text_deaths: hover_text(name, "Deaths", row.deaths, row.forecast),
    }
}
