use chrono::NaiveDate;

use covid_forecast::arima::{AutoArimaConfig, ModelError, Prediction};
use covid_forecast::backfill::{EntitySeries, SeriesPoint};
use covid_forecast::domain::{EntityRef, GeoInfo, InfoOrigin, days_after};
use covid_forecast::forecast::{AutoArima, ForecastEngine, Forecaster, Metric};

fn series(country: &str, confirmed: impl Fn(usize) -> u64, days: usize) -> EntitySeries {
    let start = NaiveDate::from_ymd_opt(2020, 2, 1).unwrap();
    let points = start
        .iter_days()
        .take(days)
        .enumerate()
        .map(|(index, date)| SeriesPoint {
            date,
            confirmed: confirmed(index),
            deaths: confirmed(index) / 10,
            recovered: None,
        })
        .collect();
    EntitySeries {
        entity: EntityRef::Country {
            country: country.to_string(),
        },
        info: GeoInfo {
            latitude: 0.0,
            longitude: 0.0,
            population: Some(1_000_000),
            origin: InfoOrigin::Reference,
        },
        points,
    }
}

/// Panics on any history whose last value is zero, otherwise extends it by one
/// per step.
struct Fragile;

impl Forecaster for Fragile {
    fn name(&self) -> &str {
        "fragile"
    }

    fn forecast(&self, history: &[f64], horizon: usize) -> Result<Prediction, ModelError> {
        let last = history.last().copied().unwrap_or(0.0);
        if last == 0.0 {
            panic!("cannot fit a zero series");
        }
        let mean: Vec<f64> = (1..=horizon).map(|step| last + step as f64).collect();
        Ok(Prediction {
            lower: mean.iter().map(|value| value - 1.0).collect(),
            upper: mean.iter().map(|value| value + 1.0).collect(),
            mean,
        })
    }
}

/// Always returns one value fewer than asked for.
struct Short;

impl Forecaster for Short {
    fn name(&self) -> &str {
        "short"
    }

    fn forecast(&self, history: &[f64], horizon: usize) -> Result<Prediction, ModelError> {
        let value = history.last().copied().unwrap_or(0.0);
        let mean = vec![value; horizon.saturating_sub(1)];
        Ok(Prediction {
            lower: mean.clone(),
            upper: mean.clone(),
            mean,
        })
    }
}

#[test]
fn forecast_dates_follow_last_observation() {
    let input = vec![series("Italy", |i| 10 * (i as u64 + 1), 30)];
    let engine = ForecastEngine::new(&Fragile, 7, Some(2));
    let outcome = engine.run(&input).unwrap();
    assert!(outcome.fallbacks.is_empty());

    let forecast = &outcome.forecasts[0];
    let last = input[0].last_date().unwrap();
    let dates: Vec<NaiveDate> = forecast.rows.iter().map(|row| row.date).collect();
    assert_eq!(dates, days_after(last, 7));
    assert_eq!(forecast.rows[0].confirmed, 301.0);
}

#[test]
fn panicking_fit_only_affects_its_entity() {
    let input = vec![
        series("Italy", |i| 10 * (i as u64 + 1), 30),
        series("Tuvalu", |_| 0, 30),
        series("Spain", |i| 5 * (i as u64 + 1), 30),
    ];
    let engine = ForecastEngine::new(&Fragile, 5, Some(3));
    let outcome = engine.run(&input).unwrap();

    assert_eq!(outcome.forecasts.len(), 3);
    for forecast in &outcome.forecasts {
        assert_eq!(forecast.rows.len(), 5, "{}", forecast.entity);
    }

    let tuvalu = outcome
        .forecasts
        .iter()
        .find(|forecast| forecast.entity.display_name() == "Tuvalu")
        .unwrap();
    assert!(tuvalu.rows.iter().all(|row| row.confirmed == 0.0));
    assert!(tuvalu.rows.iter().all(|row| row.confirmed_upper == 0.0));

    assert_eq!(outcome.fallbacks.len(), 2);
    assert!(outcome.fallbacks.iter().all(|notice| notice.entity == "Tuvalu"));
    assert!(outcome
        .fallbacks
        .iter()
        .any(|notice| notice.metric == Metric::Confirmed && notice.reason.contains("panicked")));

    let spain = outcome
        .forecasts
        .iter()
        .find(|forecast| forecast.entity.display_name() == "Spain")
        .unwrap();
    assert_eq!(spain.rows[0].confirmed, 151.0);
}

#[test]
fn constant_zero_series_falls_back_under_auto_arima() {
    let input = vec![
        series("Tuvalu", |_| 0, 40),
        series("Italy", |i| 10 * (i as u64 + 1), 40),
    ];
    let model = AutoArima::new(AutoArimaConfig::default());
    let engine = ForecastEngine::new(&model, 14, Some(2));
    let outcome = engine.run(&input).unwrap();

    let tuvalu = outcome
        .forecasts
        .iter()
        .find(|forecast| forecast.entity.display_name() == "Tuvalu")
        .unwrap();
    assert_eq!(tuvalu.rows.len(), 14);
    assert!(tuvalu.rows.iter().all(|row| row.confirmed == 0.0 && row.deaths == 0.0));

    let italy = outcome
        .forecasts
        .iter()
        .find(|forecast| forecast.entity.display_name() == "Italy")
        .unwrap();
    assert_eq!(italy.rows.len(), 14);
    assert!(italy.rows.iter().all(|row| row.confirmed.is_finite()));
    assert!(outcome.fallbacks.iter().all(|notice| notice.entity == "Tuvalu"));
}

#[test]
fn wrong_length_prediction_is_replaced() {
    let input = vec![series("Italy", |i| i as u64 + 1, 12)];
    let engine = ForecastEngine::new(&Short, 4, Some(1));
    let outcome = engine.run(&input).unwrap();
    assert_eq!(outcome.forecasts[0].rows.len(), 4);
    assert!(outcome.forecasts[0].rows.iter().all(|row| row.confirmed == 12.0));
    assert_eq!(outcome.fallbacks.len(), 2);
}
