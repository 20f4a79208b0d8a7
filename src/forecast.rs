use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::arima::{self, AutoArimaConfig, ModelError, Prediction};
use crate::backfill::EntitySeries;
use crate::domain::{EntityRef, Granularity, days_after};
use crate::error::PipelineError;

pub trait Forecaster: Send + Sync {
    fn name(&self) -> &str;
    fn forecast(&self, history: &[f64], horizon: usize) -> Result<Prediction, ModelError>;
}

#[derive(Debug, Clone, Default)]
pub struct AutoArima {
    config: AutoArimaConfig,
}

impl AutoArima {
    pub fn new(config: AutoArimaConfig) -> Self {
        Self { config }
    }
}

impl Forecaster for AutoArima {
    fn name(&self) -> &str {
        "auto-arima"
    }

    fn forecast(&self, history: &[f64], horizon: usize) -> Result<Prediction, ModelError> {
        let model = arima::fit_auto(history, &self.config)?;
        debug!(
            p = model.order.p,
            d = model.order.d,
            q = model.order.q,
            "fitted arima"
        );
        Ok(model.forecast(horizon, self.config.confidence))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlatLine;

impl FlatLine {
    pub fn predict(history: &[f64], horizon: usize) -> Prediction {
        let last = history.last().copied().unwrap_or(0.0);
        let flat = vec![last; horizon];
        Prediction {
            mean: flat.clone(),
            lower: flat.clone(),
            upper: flat,
        }
    }
}

impl Forecaster for FlatLine {
    fn name(&self) -> &str {
        "flat-line"
    }

    fn forecast(&self, history: &[f64], horizon: usize) -> Result<Prediction, ModelError> {
        Ok(Self::predict(history, horizon))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Confirmed,
    Deaths,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Confirmed => f.write_str("confirmed"),
            Metric::Deaths => f.write_str("deaths"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRow {
    pub date: NaiveDate,
    pub confirmed: f64,
    pub confirmed_upper: f64,
    pub confirmed_lower: f64,
    pub deaths: f64,
    pub deaths_upper: f64,
    pub deaths_lower: f64,
}

#[derive(Debug, Clone)]
pub struct EntityForecast {
    pub entity: EntityRef,
    pub rows: Vec<ForecastRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackNotice {
    pub entity: String,
    pub granularity: Granularity,
    pub metric: Metric,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ForecastOutcome {
    pub forecasts: Vec<EntityForecast>,
    pub fallbacks: Vec<FallbackNotice>,
}

pub struct ForecastEngine<'a, M: Forecaster + ?Sized> {
    model: &'a M,
    horizon: usize,
    workers: Option<usize>,
}

impl<'a, M: Forecaster + ?Sized> ForecastEngine<'a, M> {
    pub fn new(model: &'a M, horizon: usize, workers: Option<usize>) -> Self {
        Self {
            model,
            horizon,
            workers,
        }
    }

    pub fn run(&self, series: &[EntitySeries]) -> Result<ForecastOutcome, PipelineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers.unwrap_or(0))
            .thread_name(|index| format!("forecast-{index}"))
            .build()
            .map_err(|err| PipelineError::WorkerPool(err.to_string()))?;
        info!(
            entities = series.len(),
            horizon = self.horizon,
            threads = pool.current_num_threads(),
            model = self.model.name(),
            "forecasting"
        );

        let results: Vec<(EntityForecast, Vec<FallbackNotice>)> = pool.install(|| {
            series
                .par_iter()
                .map(|entity| self.forecast_entity(entity))
                .collect()
        });

        let mut outcome = ForecastOutcome::default();
        for (forecast, fallbacks) in results {
            outcome.forecasts.push(forecast);
            outcome.fallbacks.extend(fallbacks);
        }
        if !outcome.fallbacks.is_empty() {
            warn!(
                fallbacks = outcome.fallbacks.len(),
                "some entities fell back to a flat-line forecast"
            );
        }
        Ok(outcome)
    }

    pub fn forecast_entity(&self, series: &EntitySeries) -> (EntityForecast, Vec<FallbackNotice>) {
        let mut fallbacks = Vec::new();
        let confirmed = self.predict(series, Metric::Confirmed, &series.confirmed(), &mut fallbacks);
        let deaths = self.predict(series, Metric::Deaths, &series.deaths(), &mut fallbacks);

        let dates = series
            .last_date()
            .map(|last| days_after(last, self.horizon))
            .unwrap_or_default();
        let rows = dates
            .into_iter()
            .enumerate()
            .map(|(step, date)| ForecastRow {
                date,
                confirmed: confirmed.mean[step],
                confirmed_upper: confirmed.upper[step],
                confirmed_lower: confirmed.lower[step],
                deaths: deaths.mean[step],
                deaths_upper: deaths.upper[step],
                deaths_lower: deaths.lower[step],
            })
            .collect();
        debug!(entity = %series.entity, "forecast entity");
        (
            EntityForecast {
                entity: series.entity.clone(),
                rows,
            },
            fallbacks,
        )
    }

    fn predict(
        &self,
        series: &EntitySeries,
        metric: Metric,
        history: &[f64],
        fallbacks: &mut Vec<FallbackNotice>,
    ) -> Prediction {
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            self.model.forecast(history, self.horizon)
        }));
        let result = attempt
            .unwrap_or_else(|payload| Err(ModelError::Panicked(panic_message(payload.as_ref()))))
            .and_then(|prediction| check_prediction(prediction, self.horizon));
        match result {
            Ok(prediction) => prediction,
            Err(err) => {
                warn!(
                    entity = %series.entity,
                    metric = %metric,
                    error = %err,
                    "forecast fell back to flat line"
                );
                fallbacks.push(FallbackNotice {
                    entity: series.entity.display_name(),
                    granularity: series.entity.granularity(),
                    metric,
                    reason: err.to_string(),
                });
                FlatLine::predict(history, self.horizon)
            }
        }
    }
}

fn check_prediction(prediction: Prediction, horizon: usize) -> Result<Prediction, ModelError> {
    let lengths = [
        prediction.mean.len(),
        prediction.lower.len(),
        prediction.upper.len(),
    ];
    if let Some(&found) = lengths.iter().find(|&&len| len != horizon) {
        return Err(ModelError::WrongLength {
            expected: horizon,
            found,
        });
    }
    if !prediction.is_finite() {
        return Err(ModelError::NonFiniteForecast);
    }
    Ok(prediction)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_line_holds_last_value() {
        let prediction = FlatLine::predict(&[1.0, 4.0, 9.0], 3);
        assert_eq!(prediction.mean, vec![9.0; 3]);
        assert_eq!(prediction.lower, prediction.upper);
    }

    #[test]
    fn short_predictions_are_rejected() {
        let prediction = FlatLine::predict(&[1.0], 2);
        assert!(check_prediction(prediction.clone(), 2).is_ok());
        assert!(matches!(
            check_prediction(prediction, 3),
            Err(ModelError::WrongLength {
                expected: 3,
                found: 2
            })
        ));
    }
}
