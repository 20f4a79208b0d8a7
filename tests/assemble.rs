use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use covid_forecast::assemble::{MasterRecord, assemble};
use covid_forecast::backfill::{EntitySeries, SeriesPoint};
use covid_forecast::display::{BucketScale, DisplayConfig};
use covid_forecast::domain::{EntityRef, GeoInfo, Granularity, InfoOrigin, days_after};
use covid_forecast::forecast::{EntityForecast, ForecastRow};

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 3, 1).unwrap()
}

fn info(population: Option<u64>) -> GeoInfo {
    GeoInfo {
        latitude: 10.0,
        longitude: 20.0,
        population,
        origin: InfoOrigin::Reference,
    }
}

fn country(name: &str) -> EntityRef {
    EntityRef::Country {
        country: name.to_string(),
    }
}

fn observed(entity: EntityRef, confirmed: &[u64]) -> EntitySeries {
    let points = start()
        .iter_days()
        .zip(confirmed)
        .map(|(date, &confirmed)| SeriesPoint {
            date,
            confirmed,
            deaths: confirmed / 20,
            recovered: None,
        })
        .collect();
    EntitySeries {
        entity,
        info: info(Some(1_000_000)),
        points,
    }
}

fn forecast(series: &EntitySeries, values: &[f64]) -> EntityForecast {
    let last = series.last_date().unwrap();
    let rows = days_after(last, values.len())
        .into_iter()
        .zip(values)
        .map(|(date, &value)| ForecastRow {
            date,
            confirmed: value,
            confirmed_upper: value + 5.0,
            confirmed_lower: value - 5.0,
            deaths: value / 20.0,
            deaths_upper: value / 20.0 + 1.0,
            deaths_lower: value / 20.0 - 1.0,
        })
        .collect();
    EntityForecast {
        entity: series.entity.clone(),
        rows,
    }
}

fn worldwide_info() -> GeoInfo {
    GeoInfo {
        latitude: 0.0,
        longitude: 0.0,
        population: None,
        origin: InfoOrigin::Derived,
    }
}

fn fixture() -> (Vec<EntitySeries>, Vec<EntityForecast>) {
    let italy = observed(country("Italy"), &[10, 20, 40, 80]);
    let spain = observed(country("Spain"), &[5, 6, 7, 9]);
    let lazio = observed(
        EntityRef::Province {
            province: "Lazio".to_string(),
            country: "Italy".to_string(),
        },
        &[1, 2, 3, 4],
    );
    let forecasts = vec![
        forecast(&italy, &[100.0, 120.0, 140.0]),
        forecast(&spain, &[-3.0, -1.0, 2.0]),
        forecast(&lazio, &[5.0, 6.0, 7.0]),
    ];
    (vec![italy, spain, lazio], forecasts)
}

fn rows_for<'a>(records: &'a [MasterRecord], name: &str) -> Vec<&'a MasterRecord> {
    records.iter().filter(|record| record.entity == name).collect()
}

#[test]
fn negative_forecasts_are_clamped() {
    let (series, forecasts) = fixture();
    let dataset = assemble(&series, &forecasts, None, &DisplayConfig::default()).unwrap();
    for record in &dataset.records {
        assert!(record.confirmed >= 0.0, "{record:?}");
        assert!(record.deaths >= 0.0, "{record:?}");
        assert!(record.confirmed_lower.is_none_or(|value| value >= 0.0));
        assert!(record.deaths_lower.is_none_or(|value| value >= 0.0));
    }
    let spain = rows_for(&dataset.records, "Spain");
    let first_forecast = spain.iter().find(|record| record.forecast).unwrap();
    assert_eq!(first_forecast.confirmed, 0.0);
    assert_eq!(first_forecast.new_confirmed, 0.0);
}

#[test]
fn entity_ids_are_stable_and_ranked() {
    let (series, forecasts) = fixture();
    let display = DisplayConfig::default();
    let first = assemble(&series, &forecasts, Some(&worldwide_info()), &display).unwrap();

    let mut reversed_series = series.clone();
    reversed_series.reverse();
    let mut reversed_forecasts = forecasts.clone();
    reversed_forecasts.reverse();
    let second = assemble(
        &reversed_series,
        &reversed_forecasts,
        Some(&worldwide_info()),
        &display,
    )
    .unwrap();

    assert_eq!(first.labels, second.labels);
    assert_eq!(first.records, second.records);

    let mut ids: BTreeMap<&str, BTreeSet<u32>> = BTreeMap::new();
    for record in &first.records {
        ids.entry(record.entity.as_str())
            .or_default()
            .insert(record.entity_id);
    }
    assert!(ids.values().all(|set| set.len() == 1));

    let order: Vec<&str> = first.labels.iter().map(|label| label.name.as_str()).collect();
    assert_eq!(order, vec!["Worldwide", "Italy", "Spain", "Lazio, Italy"]);
    assert_eq!(first.labels[0].entity_id, 0);
}

#[test]
fn worldwide_sums_countries_per_date() {
    let (series, forecasts) = fixture();
    let dataset = assemble(
        &series,
        &forecasts,
        Some(&worldwide_info()),
        &DisplayConfig::default(),
    )
    .unwrap();

    let worldwide = rows_for(&dataset.records, "Worldwide");
    assert_eq!(worldwide.len(), 7);
    assert!(worldwide
        .iter()
        .all(|record| record.granularity == Granularity::Worldwide));

    for row in &worldwide {
        let expected: f64 = dataset
            .records
            .iter()
            .filter(|record| {
                record.granularity == Granularity::Country
                    && record.date == row.date
                    && record.forecast == row.forecast
            })
            .map(|record| record.confirmed)
            .sum();
        assert_eq!(row.confirmed, expected, "{}", row.date);
    }
    // Spain's -3 is clamped before summing.
    let first_forecast = worldwide.iter().find(|record| record.forecast).unwrap();
    assert_eq!(first_forecast.confirmed, 100.0);
}

#[test]
fn observed_then_contiguous_forecast_rows() {
    let (series, forecasts) = fixture();
    let dataset = assemble(&series, &forecasts, None, &DisplayConfig::default()).unwrap();
    let italy = rows_for(&dataset.records, "Italy");

    let observed: Vec<&&MasterRecord> = italy.iter().filter(|record| !record.forecast).collect();
    let predicted: Vec<&&MasterRecord> = italy.iter().filter(|record| record.forecast).collect();
    assert_eq!(observed.len(), 4);
    assert_eq!(predicted.len(), 3);

    let last_observed = observed.iter().map(|record| record.date).max().unwrap();
    let forecast_dates: Vec<NaiveDate> = predicted.iter().map(|record| record.date).collect();
    assert_eq!(forecast_dates, days_after(last_observed, 3));

    assert_eq!(observed[0].text_confirmed, "Italy<br>Total Cases: 10");
    assert_eq!(predicted[0].text_confirmed, "Italy<br>Predicted Cases: 100");
    assert_eq!(observed[0].date_text, "03/01/20");
    assert_eq!(observed[1].new_confirmed, 10.0);
    assert_eq!(observed[0].per_capita_confirmed, Some(10.0 / 1_000_000.0));
    assert!(predicted[0].confirmed_upper.is_some());
    assert!(observed[0].confirmed_upper.is_none());
}

#[test]
fn records_sorted_by_id_then_date() {
    let (series, forecasts) = fixture();
    let dataset = assemble(
        &series,
        &forecasts,
        Some(&worldwide_info()),
        &DisplayConfig::default(),
    )
    .unwrap();
    assert!(dataset
        .records
        .windows(2)
        .all(|pair| (pair[0].entity_id, pair[0].date) < (pair[1].entity_id, pair[1].date)));
}

#[test]
fn worldwide_stays_out_of_bucket_edges() {
    let (series, forecasts) = fixture();
    let display = DisplayConfig::default();
    let without = assemble(&series, &forecasts, None, &display).unwrap();
    let with = assemble(&series, &forecasts, Some(&worldwide_info()), &display).unwrap();

    let buckets = |records: &[MasterRecord]| -> Vec<(String, NaiveDate, String, String, String)> {
        records
            .iter()
            .filter(|record| record.granularity != Granularity::Worldwide)
            .map(|record| {
                (
                    record.entity.clone(),
                    record.date,
                    record.confirmed_bucket.clone(),
                    record.confirmed_color.clone(),
                    record.deaths_bucket.clone(),
                )
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    };
    assert_eq!(buckets(&without.records), buckets(&with.records));

    let observed: Vec<f64> = without
        .records
        .iter()
        .filter(|record| !record.forecast)
        .map(|record| record.confirmed)
        .collect();
    let scale = BucketScale::from_values(
        &observed,
        &display.quantiles,
        &display.sizes,
        &display.case_colors,
    );
    let worldwide = rows_for(&with.records, "Worldwide");
    assert!(!worldwide.is_empty());
    for record in worldwide {
        let bucket = scale.bucket(record.confirmed);
        assert_eq!(record.confirmed_bucket, scale.label(bucket));
        assert_eq!(record.confirmed_color, scale.color(bucket));
        assert_eq!(record.confirmed_size, scale.size(bucket));
    }
}
