use std::collections::BTreeMap;

use assert_matches::assert_matches;
use chrono::NaiveDate;

use covid_forecast::backfill::{backfill, backfill_all, calendar};
use covid_forecast::domain::{DateRange, EntityRef, GeoInfo, InfoOrigin};
use covid_forecast::error::PipelineError;
use covid_forecast::resolve::{Observation, Resolution, ResolvedEntity};

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 3, d).unwrap()
}

fn obs(d: u32, confirmed: u64) -> Observation {
    Observation {
        date: day(d),
        confirmed,
        deaths: confirmed / 10,
        recovered: None,
    }
}

fn entity(country: &str, observations: Vec<Observation>) -> ResolvedEntity {
    ResolvedEntity {
        entity: EntityRef::Country {
            country: country.to_string(),
        },
        info: GeoInfo {
            latitude: 0.0,
            longitude: 0.0,
            population: None,
            origin: InfoOrigin::Observed,
        },
        observations,
    }
}

#[test]
fn every_entity_covers_the_calendar_once() {
    let entities: BTreeMap<EntityRef, ResolvedEntity> = [
        entity("Italy", vec![obs(1, 3), obs(4, 20), obs(9, 80)]),
        entity("Spain", vec![obs(5, 2)]),
        entity("France", vec![obs(2, 1), obs(3, 1), obs(10, 40)]),
    ]
    .into_iter()
    .map(|resolved| (resolved.entity.clone(), resolved))
    .collect();
    let resolution = Resolution {
        entities,
        worldwide: None,
        warnings: Vec::new(),
    };

    let range = calendar(&resolution, None).unwrap();
    assert_eq!(range, DateRange::new(day(1), day(10)).unwrap());

    let series = backfill_all(&resolution, &range).unwrap();
    assert_eq!(series.len(), 3);
    for entity in &series {
        let dates: Vec<NaiveDate> = entity.points.iter().map(|point| point.date).collect();
        let expected: Vec<NaiveDate> = range.days().collect();
        assert_eq!(dates, expected, "{}", entity.entity);
    }
}

#[test]
fn interior_gap_carries_previous_value() {
    let range = DateRange::new(day(1), day(3)).unwrap();
    let series = backfill(&entity("Italy", vec![obs(1, 5), obs(3, 9)]), &range).unwrap();
    let confirmed: Vec<u64> = series.points.iter().map(|point| point.confirmed).collect();
    assert_eq!(confirmed, vec![5, 5, 9]);
}

#[test]
fn leading_gap_takes_first_value() {
    let range = DateRange::new(day(1), day(4)).unwrap();
    let series = backfill(&entity("Italy", vec![obs(2, 7), obs(4, 11)]), &range).unwrap();
    assert_eq!(series.points[0].date, day(1));
    assert_eq!(series.points[0].confirmed, 7);
    assert_eq!(series.points[3].confirmed, 11);
}

#[test]
fn trailing_gap_carries_last_value() {
    let range = DateRange::new(day(1), day(5)).unwrap();
    let series = backfill(&entity("Italy", vec![obs(1, 2), obs(2, 4)]), &range).unwrap();
    let confirmed: Vec<u64> = series.points.iter().map(|point| point.confirmed).collect();
    assert_eq!(confirmed, vec![2, 4, 4, 4, 4]);
}

#[test]
fn observations_before_the_calendar_seed_the_fill() {
    let range = DateRange::new(day(3), day(5)).unwrap();
    let series = backfill(&entity("Italy", vec![obs(1, 6), obs(5, 8)]), &range).unwrap();
    let confirmed: Vec<u64> = series.points.iter().map(|point| point.confirmed).collect();
    assert_eq!(confirmed, vec![6, 6, 8]);
}

#[test]
fn duplicate_date_is_fatal() {
    let range = DateRange::new(day(1), day(3)).unwrap();
    let result = backfill(&entity("Italy", vec![obs(1, 5), obs(1, 6)]), &range);
    assert_matches!(
        result,
        Err(PipelineError::BackfillCardinality {
            duplicate: Some(date),
            ..
        }) if date == day(1)
    );
}

#[test]
fn calendar_start_extends_the_range() {
    let resolution = Resolution {
        entities: [entity("Italy", vec![obs(5, 1)])]
            .into_iter()
            .map(|resolved| (resolved.entity.clone(), resolved))
            .collect(),
        worldwide: None,
        warnings: Vec::new(),
    };
    let range = calendar(&resolution, Some(day(1))).unwrap();
    assert_eq!(range.num_days(), 5);
    assert_matches!(
        calendar(&resolution, Some(day(9))),
        Err(PipelineError::EmptyDataset(_))
    );
}
