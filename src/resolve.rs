use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ManualOverride, TieBreak};
use crate::domain::{EntityRef, GeoInfo, Granularity, InfoOrigin, RawObservation, Source};
use crate::error::PipelineError;
use crate::ingest::{RawSources, RawTable};
use crate::reference::{Centroid, ReferenceTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub confirmed: u64,
    pub deaths: u64,
    pub recovered: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    pub entity: EntityRef,
    pub info: GeoInfo,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionWarning {
    pub entity: String,
    pub granularity: Granularity,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub entities: BTreeMap<EntityRef, ResolvedEntity>,
    pub worldwide: Option<GeoInfo>,
    pub warnings: Vec<ResolutionWarning>,
}

impl Resolution {
    pub fn date_bounds(&self) -> Option<(NaiveDate, NaiveDate)> {
        let mut dates = self
            .entities
            .values()
            .flat_map(|entity| entity.observations.iter().map(|obs| obs.date));
        let first = dates.next()?;
        Some(dates.fold((first, first), |(lo, hi), date| {
            (lo.min(date), hi.max(date))
        }))
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    entity: EntityRef,
    observation: Observation,
    source: Source,
    updated_at: Option<DateTime<Utc>>,
    country_code: Option<String>,
    fips: Option<u32>,
    coordinates: Option<(f64, f64)>,
    order: usize,
}

pub struct Resolver<'a> {
    pub reference: &'a ReferenceTable,
    pub tie_break: &'a TieBreak,
    pub manual: &'a BTreeMap<String, ManualOverride>,
    pub worldwide: bool,
}

impl Resolver<'_> {
    pub fn resolve(&self, sources: &RawSources) -> Result<Resolution, PipelineError> {
        let mut candidates = Vec::new();
        for table in sources.tables.values() {
            let rows = dedupe(&table.rows);
            debug!(
                feed = %table.feed,
                raw = table.rows.len(),
                unique = rows.len(),
                "deduplicated feed"
            );
            derive_candidates(table, &rows, &mut candidates);
        }
        let merged = self.merge(candidates);
        if merged.is_empty() {
            return Err(PipelineError::EmptyDataset(
                "no entity observations after resolution".to_string(),
            ));
        }

        let mut warnings = Vec::new();
        let mut entities = BTreeMap::new();
        for (entity, mut group) in merged {
            group.sort_by_key(|candidate| candidate.observation.date);
            let info = self.enrich(&entity, &group, &mut warnings);
            let observations = group
                .iter()
                .map(|candidate| candidate.observation)
                .collect();
            entities.insert(
                entity.clone(),
                ResolvedEntity {
                    entity,
                    info,
                    observations,
                },
            );
        }

        let worldwide = self.declare_worldwide(&entities);
        info!(
            entities = entities.len(),
            warnings = warnings.len(),
            worldwide = worldwide.is_some(),
            "resolved entities"
        );
        Ok(Resolution {
            entities,
            worldwide,
            warnings,
        })
    }

    fn merge(&self, candidates: Vec<Candidate>) -> BTreeMap<EntityRef, Vec<Candidate>> {
        let mut winners: HashMap<(EntityRef, NaiveDate), Candidate> = HashMap::new();
        for candidate in candidates {
            let key = (candidate.entity.clone(), candidate.observation.date);
            match winners.get(&key) {
                Some(current) if self.compare(current, &candidate) != Ordering::Greater => {}
                _ => {
                    winners.insert(key, candidate);
                }
            }
        }
        let mut grouped: BTreeMap<EntityRef, Vec<Candidate>> = BTreeMap::new();
        for ((entity, _), candidate) in winners {
            grouped.entry(entity).or_default().push(candidate);
        }
        grouped
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        self.tie_break
            .rank(&a.source)
            .cmp(&self.tie_break.rank(&b.source))
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| b.observation.confirmed.cmp(&a.observation.confirmed))
            .then_with(|| a.order.cmp(&b.order))
    }

    fn enrich(
        &self,
        entity: &EntityRef,
        group: &[Candidate],
        warnings: &mut Vec<ResolutionWarning>,
    ) -> GeoInfo {
        let latest_with =
            move |pick: fn(&Candidate) -> bool| group.iter().rev().find(|c| pick(c));
        let code = latest_with(|c| c.country_code.is_some())
            .and_then(|c| c.country_code.as_deref());
        let fips = latest_with(|c| c.fips.is_some()).and_then(|c| c.fips);
        let observed = latest_with(|c| c.coordinates.is_some()).and_then(|c| c.coordinates);

        let reference = match entity {
            EntityRef::Country { country } => self.reference.country(code, country),
            EntityRef::State { state, .. } => self.reference.state(state),
            EntityRef::County { county, state, .. } => {
                self.reference.county(fips, county, state.as_deref())
            }
            EntityRef::Province { .. } | EntityRef::Worldwide => None,
        };
        let name = entity.display_name();
        let manual = self.manual.get(&name);
        let mut warn_entity = |message: String| {
            warn!(entity = %entity, "{message}");
            warnings.push(ResolutionWarning {
                entity: name.clone(),
                granularity: entity.granularity(),
                message,
            });
        };

        let manual_coordinates =
            manual.and_then(|manual| Some((manual.latitude?, manual.longitude?)));
        let (latitude, longitude, origin) = match (reference, manual_coordinates, observed) {
            (Some(Centroid {
                latitude,
                longitude,
                ..
            }), _, _) => (latitude, longitude, InfoOrigin::Reference),
            (None, Some((lat, lon)), _) => (lat, lon, InfoOrigin::Manual),
            (None, None, Some((lat, lon))) => {
                warn_entity("no reference match, using observed coordinates".to_string());
                (lat, lon, InfoOrigin::Observed)
            }
            (None, None, None) => {
                warn_entity("no coordinates from reference, overrides or feeds".to_string());
                (0.0, 0.0, InfoOrigin::Observed)
            }
        };

        let population = reference
            .and_then(|centroid| centroid.population)
            .or_else(|| manual.and_then(|manual| manual.population));
        if population.is_none() {
            warn_entity("population unknown".to_string());
        }

        GeoInfo {
            latitude,
            longitude,
            population,
            origin,
        }
    }

    fn declare_worldwide(&self, entities: &BTreeMap<EntityRef, ResolvedEntity>) -> Option<GeoInfo> {
        if !self.worldwide {
            return None;
        }
        let countries: Vec<&ResolvedEntity> = entities
            .values()
            .filter(|resolved| resolved.entity.granularity() == Granularity::Country)
            .collect();
        if countries.is_empty() {
            return None;
        }
        let population: u64 = countries
            .iter()
            .filter_map(|resolved| resolved.info.population)
            .sum();
        let manual = self.manual.get(&EntityRef::Worldwide.display_name());
        let (latitude, longitude, origin) =
            match manual.and_then(|manual| Some((manual.latitude?, manual.longitude?))) {
                Some((lat, lon)) => (lat, lon, InfoOrigin::Manual),
                None => (0.0, 0.0, InfoOrigin::Derived),
            };
        Some(GeoInfo {
            latitude,
            longitude,
            population: (population > 0).then_some(population),
            origin,
        })
    }
}

type RowKey<'a> = (&'a str, Option<&'a str>, Option<&'a str>, NaiveDate);

pub fn dedupe(rows: &[RawObservation]) -> Vec<&RawObservation> {
    let mut kept: Vec<&RawObservation> = Vec::with_capacity(rows.len());
    let mut index: HashMap<RowKey<'_>, usize> = HashMap::new();
    for row in rows {
        let key = (
            row.country.as_str(),
            row.province.as_deref(),
            row.county.as_deref(),
            row.date,
        );
        match index.get(&key) {
            Some(&position) => {
                if row.confirmed > kept[position].confirmed {
                    kept[position] = row;
                }
            }
            None => {
                index.insert(key, kept.len());
                kept.push(row);
            }
        }
    }
    kept
}

fn derive_candidates(table: &RawTable, rows: &[&RawObservation], out: &mut Vec<Candidate>) {
    for granularity in &table.granularities {
        match granularity {
            Granularity::Country => derive_countries(table, rows, out),
            Granularity::Province | Granularity::State => {
                for row in rows.iter().filter(|row| row.county.is_none()) {
                    let Some(region) = row.province.clone() else {
                        continue;
                    };
                    let entity = if *granularity == Granularity::Province {
                        EntityRef::Province {
                            province: region,
                            country: row.country.clone(),
                        }
                    } else {
                        EntityRef::State {
                            state: region,
                            country: row.country.clone(),
                        }
                    };
                    push_row(table, entity, row, out);
                }
            }
            Granularity::County => {
                for row in rows {
                    let Some(county) = row.county.clone() else {
                        continue;
                    };
                    let entity = EntityRef::County {
                        county,
                        state: row.province.clone(),
                        country: row.country.clone(),
                    };
                    push_row(table, entity, row, out);
                }
            }
            Granularity::Worldwide => {}
        }
    }
}

fn push_row(table: &RawTable, entity: EntityRef, row: &RawObservation, out: &mut Vec<Candidate>) {
    let order = out.len();
    out.push(Candidate {
        entity,
        observation: Observation {
            date: row.date,
            confirmed: row.confirmed,
            deaths: row.deaths,
            recovered: row.recovered,
        },
        source: table.source.clone(),
        updated_at: row.updated_at,
        country_code: row.country_code.clone(),
        fips: row.fips,
        coordinates: row.latitude.zip(row.longitude),
        order,
    });
}

fn derive_countries(table: &RawTable, rows: &[&RawObservation], out: &mut Vec<Candidate>) {
    let mut totals: BTreeMap<(&str, NaiveDate), (Observation, &RawObservation)> = BTreeMap::new();
    for &row in rows {
        let (total, best) = totals.entry((row.country.as_str(), row.date)).or_insert((
            Observation {
                date: row.date,
                confirmed: 0,
                deaths: 0,
                recovered: None,
            },
            row,
        ));
        total.confirmed += row.confirmed;
        total.deaths += row.deaths;
        if let Some(recovered) = row.recovered {
            total.recovered = Some(total.recovered.unwrap_or(0) + recovered);
        }
        if row.confirmed > best.confirmed {
            *best = row;
        }
    }
    for ((country, _), (observation, best)) in totals {
        let order = out.len();
        out.push(Candidate {
            entity: EntityRef::Country {
                country: country.to_string(),
            },
            observation,
            source: table.source.clone(),
            updated_at: best.updated_at,
            country_code: best.country_code.clone(),
            fips: None,
            coordinates: best.latitude.zip(best.longitude),
            order,
        });
    }
}
