use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{DateRange, EntityRef, GeoInfo};
use crate::error::PipelineError;
use crate::resolve::{Observation, Resolution, ResolvedEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub confirmed: u64,
    pub deaths: u64,
    pub recovered: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EntitySeries {
    pub entity: EntityRef,
    pub info: GeoInfo,
    pub points: Vec<SeriesPoint>,
}

impl EntitySeries {
    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|point| point.date)
    }

    pub fn confirmed(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.confirmed as f64).collect()
    }

    pub fn deaths(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.deaths as f64).collect()
    }
}

pub fn calendar(
    resolution: &Resolution,
    calendar_start: Option<NaiveDate>,
) -> Result<DateRange, PipelineError> {
    let (earliest, latest) = resolution.date_bounds().ok_or_else(|| {
        PipelineError::EmptyDataset("no dated observations to backfill".to_string())
    })?;
    DateRange::new(calendar_start.unwrap_or(earliest), latest)
}

pub fn backfill_all(
    resolution: &Resolution,
    range: &DateRange,
) -> Result<Vec<EntitySeries>, PipelineError> {
    let series = resolution
        .entities
        .values()
        .map(|entity| backfill(entity, range))
        .collect::<Result<Vec<_>, _>>()?;
    info!(
        entities = series.len(),
        days = range.num_days(),
        start = %range.start,
        end = %range.end,
        "backfilled series"
    );
    Ok(series)
}

pub fn backfill(entity: &ResolvedEntity, range: &DateRange) -> Result<EntitySeries, PipelineError> {
    let cardinality = |found: usize, duplicate: Option<NaiveDate>| {
        PipelineError::BackfillCardinality {
            entity: entity.entity.to_string(),
            expected: range.num_days(),
            found,
            duplicate,
        }
    };

    let mut by_date: BTreeMap<NaiveDate, &Observation> = BTreeMap::new();
    for observation in &entity.observations {
        if by_date.insert(observation.date, observation).is_some() {
            return Err(cardinality(
                entity.observations.len(),
                Some(observation.date),
            ));
        }
    }

    let mut carried: Option<&Observation> = by_date
        .range(..range.start)
        .next_back()
        .map(|(_, observation)| *observation);
    let mut filled: Vec<(NaiveDate, Option<&Observation>)> = Vec::with_capacity(range.num_days());
    for date in range.days() {
        if let Some(observation) = by_date.get(&date) {
            carried = Some(*observation);
        }
        filled.push((date, carried));
    }

    let first_known = filled.iter().find_map(|(_, observation)| *observation);
    let Some(first_known) = first_known else {
        return Err(cardinality(0, None));
    };

    let reports_recovered = entity
        .observations
        .iter()
        .any(|observation| observation.recovered.is_some());
    let mut last_recovered = None;
    let mut points = Vec::with_capacity(filled.len());
    for (date, observation) in filled {
        let observation = observation.unwrap_or(first_known);
        let recovered = if reports_recovered {
            last_recovered = observation.recovered.or(last_recovered);
            last_recovered
        } else {
            None
        };
        points.push(SeriesPoint {
            date,
            confirmed: observation.confirmed,
            deaths: observation.deaths,
            recovered,
        });
    }
    if reports_recovered {
        let first_recovered = points.iter().find_map(|point| point.recovered);
        for point in points.iter_mut().take_while(|point| point.recovered.is_none()) {
            point.recovered = first_recovered;
        }
    }

    if points.len() != range.num_days() {
        return Err(cardinality(points.len(), None));
    }
    debug!(entity = %entity.entity, days = points.len(), "backfilled entity");
    Ok(EntitySeries {
        entity: entity.entity.clone(),
        info: entity.info.clone(),
        points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InfoOrigin;

    #[test]
    fn recovered_fills_like_counts() {
        let day = |d| NaiveDate::from_ymd_opt(2020, 4, d).unwrap();
        let entity = ResolvedEntity {
            entity: EntityRef::Country {
                country: "Iceland".to_string(),
            },
            info: GeoInfo {
                latitude: 64.9,
                longitude: -18.6,
                population: Some(364_134),
                origin: InfoOrigin::Reference,
            },
            observations: vec![
                Observation {
                    date: day(2),
                    confirmed: 10,
                    deaths: 0,
                    recovered: None,
                },
                Observation {
                    date: day(3),
                    confirmed: 12,
                    deaths: 1,
                    recovered: Some(4),
                },
            ],
        };
        let range = DateRange::new(day(1), day(4)).unwrap();
        let series = backfill(&entity, &range).unwrap();
        let recovered: Vec<_> = series.points.iter().map(|p| p.recovered).collect();
        assert_eq!(recovered, vec![Some(4), Some(4), Some(4), Some(4)]);
    }
}
