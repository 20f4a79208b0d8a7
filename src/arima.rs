//! Non-seasonal ARIMA with automatic order selection.
//!
//! The differencing order comes from repeated KPSS level-stationarity tests.
//! ARMA coefficients are fit to the differenced series by conditional sum of
//! squares, and `(p, q)` is chosen by a stepwise AIC search.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::error::PipelineError;

const KPSS_CRITICAL_5PCT: f64 = 0.463;
const NM_MAX_ITERATIONS: usize = 2_000;
const NM_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoArimaConfig {
    pub max_p: usize,
    pub max_q: usize,
    pub max_d: usize,
    pub min_observations: usize,
    pub confidence: f64,
}

impl Default for AutoArimaConfig {
    fn default() -> Self {
        Self {
            max_p: 5,
            max_q: 5,
            max_d: 2,
            min_observations: 10,
            confidence: 0.95,
        }
    }
}

impl AutoArimaConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "model.confidence must be between 0 and 1, got {}",
                self.confidence
            )));
        }
        if self.max_d > 2 {
            return Err(PipelineError::InvalidConfig(
                "model.max_d above 2 is not supported".to_string(),
            ));
        }
        if self.min_observations < 3 {
            return Err(PipelineError::InvalidConfig(
                "model.min_observations must be at least 3".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("series contains non-finite values")]
    NonFinite,

    #[error("series has {len} observations, at least {required} required")]
    TooShort { len: usize, required: usize },

    #[error("series is constant")]
    ConstantSeries,

    #[error("no ARMA order could be fit")]
    NoFit,

    #[error("model panicked: {0}")]
    Panicked(String),

    #[error("model returned {found} steps, expected {expected}")]
    WrongLength { expected: usize, found: usize },

    #[error("model returned non-finite forecasts")]
    NonFiniteForecast,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub mean: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Prediction {
    pub fn is_finite(&self) -> bool {
        self.mean
            .iter()
            .chain(&self.lower)
            .chain(&self.upper)
            .all(|value| value.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ArimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

#[derive(Debug, Clone)]
pub struct ArimaModel {
    pub order: ArimaOrder,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    pub mean: f64,
    pub sigma2: f64,
    pub aic: f64,
    centered: Vec<f64>,
    residuals: Vec<f64>,
    anchors: Vec<f64>,
}

impl ArimaModel {
    pub fn forecast(&self, horizon: usize, confidence: f64) -> Prediction {
        let n = self.centered.len();
        let mut xs = self.centered.clone();
        let mut es = self.residuals.clone();
        for step in 0..horizon {
            let t = n + step;
            let ar: f64 = (1..=self.order.p)
                .map(|i| self.ar[i - 1] * xs[t - i])
                .sum();
            let ma: f64 = (1..=self.order.q)
                .map(|j| self.ma[j - 1] * es[t - j])
                .sum();
            xs.push(ar + ma);
            es.push(0.0);
        }
        let mut mean: Vec<f64> = xs[n..].iter().map(|x| x + self.mean).collect();
        for anchor in self.anchors.iter().rev() {
            let mut level = *anchor;
            for value in &mut mean {
                level += *value;
                *value = level;
            }
        }

        let z = normal_quantile(0.5 + confidence / 2.0);
        let psi = psi_weights(&self.ar, &self.ma, self.order.d, horizon);
        let mut cumulative = 0.0;
        let mut lower = Vec::with_capacity(horizon);
        let mut upper = Vec::with_capacity(horizon);
        for (value, weight) in mean.iter().zip(&psi) {
            cumulative += weight * weight;
            let half_width = z * (self.sigma2 * cumulative).sqrt();
            lower.push(value - half_width);
            upper.push(value + half_width);
        }
        Prediction { mean, lower, upper }
    }
}

pub fn fit_auto(series: &[f64], config: &AutoArimaConfig) -> Result<ArimaModel, ModelError> {
    if series.iter().any(|value| !value.is_finite()) {
        return Err(ModelError::NonFinite);
    }
    if series.len() < config.min_observations.max(3) {
        return Err(ModelError::TooShort {
            len: series.len(),
            required: config.min_observations.max(3),
        });
    }
    if is_constant(series) {
        return Err(ModelError::ConstantSeries);
    }

    let d = select_differencing(series, config.max_d);
    let mut anchors = Vec::with_capacity(d);
    let mut working = series.to_vec();
    for _ in 0..d {
        anchors.push(working[working.len() - 1]);
        working = difference(&working);
    }

    if is_constant(&working) {
        let drift = working[0];
        return Ok(ArimaModel {
            order: ArimaOrder { p: 0, d, q: 0 },
            ar: Vec::new(),
            ma: Vec::new(),
            mean: drift,
            sigma2: 0.0,
            aic: f64::NEG_INFINITY,
            centered: vec![0.0; working.len()],
            residuals: vec![0.0; working.len()],
            anchors,
        });
    }

    let include_mean = d <= 1;
    let (order, fit) = stepwise_search(&working, d, include_mean, config)?;
    trace!(p = order.p, d = order.d, q = order.q, aic = fit.aic, "selected order");
    Ok(ArimaModel {
        order,
        ar: fit.ar,
        ma: fit.ma,
        mean: fit.mean,
        sigma2: fit.sigma2,
        aic: fit.aic,
        centered: fit.centered,
        residuals: fit.residuals,
        anchors,
    })
}

#[derive(Debug, Clone)]
struct ArmaFit {
    ar: Vec<f64>,
    ma: Vec<f64>,
    mean: f64,
    sigma2: f64,
    aic: f64,
    centered: Vec<f64>,
    residuals: Vec<f64>,
}

fn stepwise_search(
    w: &[f64],
    d: usize,
    include_mean: bool,
    config: &AutoArimaConfig,
) -> Result<(ArimaOrder, ArmaFit), ModelError> {
    // All candidates condition on the same leading points.
    let condition = config.max_p.min(w.len().saturating_sub(2));
    let max_p = config.max_p.min(condition);
    let max_q = config.max_q;
    let mut visited = HashSet::new();
    let mut best: Option<(ArimaOrder, ArmaFit)> = None;

    let mut consider = |p: usize, q: usize, best: &mut Option<(ArimaOrder, ArmaFit)>| -> bool {
        if p > max_p || q > max_q || !visited.insert((p, q)) {
            return false;
        }
        let Some(fit) = fit_arma(w, p, q, include_mean, condition) else {
            return false;
        };
        let better = best.as_ref().is_none_or(|(_, current)| fit.aic < current.aic);
        if better {
            *best = Some((ArimaOrder { p, d, q }, fit));
        }
        better
    };

    for (p, q) in [(2, 2), (0, 0), (1, 0), (0, 1)] {
        consider(p, q, &mut best);
    }
    loop {
        let Some((center, _)) = &best else {
            return Err(ModelError::NoFit);
        };
        let (p, q) = (center.p as isize, center.q as isize);
        let improved = [
            (-1, 0),
            (1, 0),
            (0, -1),
            (0, 1),
            (-1, -1),
            (1, 1),
            (-1, 1),
            (1, -1),
        ]
        .into_iter()
        .filter_map(|(dp, dq)| {
            let np = usize::try_from(p + dp).ok()?;
            let nq = usize::try_from(q + dq).ok()?;
            Some((np, nq))
        })
        .any(|(np, nq)| consider(np, nq, &mut best));
        if !improved {
            break;
        }
    }
    best.ok_or(ModelError::NoFit)
}

fn fit_arma(w: &[f64], p: usize, q: usize, include_mean: bool, condition: usize) -> Option<ArmaFit> {
    let n = w.len();
    let k = p + q + usize::from(include_mean);
    if condition < p || n <= condition + k + 1 {
        return None;
    }
    let offset = if include_mean { mean(w) } else { 0.0 };
    let scale = std_dev(w, offset);
    if scale <= 0.0 || !scale.is_finite() {
        return None;
    }
    let z: Vec<f64> = w.iter().map(|value| (value - offset) / scale).collect();

    let objective = |params: &[f64]| -> f64 {
        let (ar, rest) = params.split_at(p);
        let (ma, level) = rest.split_at(q);
        if !is_stationary(ar) || !is_invertible(ma) {
            return f64::INFINITY;
        }
        let mu = level.first().copied().unwrap_or(0.0);
        let (sse, _) = css(&z, ar, ma, mu, condition);
        if sse.is_finite() { sse } else { f64::INFINITY }
    };
    let (params, value) = nelder_mead(objective, &vec![0.0; k], 0.1);
    if !value.is_finite() {
        return None;
    }

    let (ar, rest) = params.split_at(p);
    let (ma, level) = rest.split_at(q);
    let mu = level.first().copied().unwrap_or(0.0);
    let (sse, residuals) = css(&z, ar, ma, mu, condition);
    let n_eff = (n - condition) as f64;
    let sigma2 = scale * scale * sse / n_eff;
    if !(sigma2 > 0.0 && sigma2.is_finite()) {
        return None;
    }
    let log_likelihood = -0.5 * n_eff * ((2.0 * std::f64::consts::PI * sigma2).ln() + 1.0);
    let aic = -2.0 * log_likelihood + 2.0 * (k + 1) as f64;

    Some(ArmaFit {
        ar: ar.to_vec(),
        ma: ma.to_vec(),
        mean: offset + scale * mu,
        sigma2,
        aic,
        centered: z.iter().map(|value| (value - mu) * scale).collect(),
        residuals: residuals.iter().map(|e| e * scale).collect(),
    })
}

fn css(z: &[f64], ar: &[f64], ma: &[f64], mu: f64, condition: usize) -> (f64, Vec<f64>) {
    let p = ar.len();
    let x: Vec<f64> = z.iter().map(|value| value - mu).collect();
    let mut residuals = vec![0.0; x.len()];
    let mut sse = 0.0;
    for t in p..x.len() {
        let mut e = x[t];
        for (i, phi) in ar.iter().enumerate() {
            e -= phi * x[t - i - 1];
        }
        for (j, theta) in ma.iter().enumerate() {
            if t > j {
                e -= theta * residuals[t - j - 1];
            }
        }
        residuals[t] = e;
        if t >= condition {
            sse += e * e;
        }
    }
    (sse, residuals)
}

fn nelder_mead<F: Fn(&[f64]) -> f64>(f: F, start: &[f64], step: f64) -> (Vec<f64>, f64) {
    const REFLECT: f64 = 1.0;
    const EXPAND: f64 = 2.0;
    const CONTRACT: f64 = 0.5;
    const SHRINK: f64 = 0.5;

    let dim = start.len();
    if dim == 0 {
        return (Vec::new(), f(start));
    }
    let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(dim + 1);
    simplex.push((start.to_vec(), f(start)));
    for i in 0..dim {
        let mut vertex = start.to_vec();
        vertex[i] += step;
        let value = f(&vertex);
        simplex.push((vertex, value));
    }

    let toward = |from: &[f64], to: &[f64], factor: f64| -> Vec<f64> {
        from.iter()
            .zip(to)
            .map(|(a, b)| a + factor * (b - a))
            .collect()
    };

    for _ in 0..NM_MAX_ITERATIONS {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let best = simplex[0].1;
        let worst = simplex[dim].1;
        if best.is_finite()
            && worst.is_finite()
            && (worst - best).abs() <= NM_TOLERANCE * (best.abs() + NM_TOLERANCE)
        {
            break;
        }

        let mut centroid = vec![0.0; dim];
        for (vertex, _) in &simplex[..dim] {
            for (c, v) in centroid.iter_mut().zip(vertex) {
                *c += v / dim as f64;
            }
        }

        let reflected = toward(&centroid, &simplex[dim].0, -REFLECT);
        let reflected_value = f(&reflected);
        if reflected_value < best {
            let expanded = toward(&centroid, &reflected, EXPAND);
            let expanded_value = f(&expanded);
            simplex[dim] = if expanded_value < reflected_value {
                (expanded, expanded_value)
            } else {
                (reflected, reflected_value)
            };
            continue;
        }
        if reflected_value < simplex[dim - 1].1 {
            simplex[dim] = (reflected, reflected_value);
            continue;
        }
        let contracted = toward(&centroid, &simplex[dim].0, CONTRACT);
        let contracted_value = f(&contracted);
        if contracted_value < worst {
            simplex[dim] = (contracted, contracted_value);
            continue;
        }
        let anchor = simplex[0].0.clone();
        for (vertex, value) in simplex.iter_mut().skip(1) {
            *vertex = toward(&anchor, vertex.as_slice(), SHRINK);
            *value = f(vertex.as_slice());
        }
    }
    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
    simplex.swap_remove(0)
}

pub fn is_stationary(ar: &[f64]) -> bool {
    let mut coefficients = ar.to_vec();
    while let Some(&reflection) = coefficients.last() {
        if !reflection.is_finite() || reflection.abs() >= 1.0 {
            return false;
        }
        let k = coefficients.len();
        let denominator = 1.0 - reflection * reflection;
        coefficients = (0..k - 1)
            .map(|j| (coefficients[j] + reflection * coefficients[k - 2 - j]) / denominator)
            .collect();
    }
    true
}

pub fn is_invertible(ma: &[f64]) -> bool {
    let negated: Vec<f64> = ma.iter().map(|theta| -theta).collect();
    is_stationary(&negated)
}

pub fn kpss_statistic(series: &[f64]) -> Option<f64> {
    let n = series.len();
    if n < 2 {
        return None;
    }
    let level = mean(series);
    let residuals: Vec<f64> = series.iter().map(|value| value - level).collect();
    let mut partial = 0.0;
    let mut eta = 0.0;
    for e in &residuals {
        partial += e;
        eta += partial * partial;
    }
    let nf = n as f64;
    eta /= nf * nf;

    let lags = (3.0 * nf.sqrt() / 13.0).floor() as usize;
    let mut long_run = residuals.iter().map(|e| e * e).sum::<f64>() / nf;
    for lag in 1..=lags.min(n - 1) {
        let weight = 1.0 - lag as f64 / (lags as f64 + 1.0);
        let covariance: f64 = (lag..n)
            .map(|t| residuals[t] * residuals[t - lag])
            .sum::<f64>()
            / nf;
        long_run += 2.0 * weight * covariance;
    }
    (long_run > 0.0).then(|| eta / long_run)
}

pub fn select_differencing(series: &[f64], max_d: usize) -> usize {
    let mut working = series.to_vec();
    let mut d = 0;
    while d < max_d && working.len() > 3 && !is_constant(&working) {
        match kpss_statistic(&working) {
            Some(statistic) if statistic > KPSS_CRITICAL_5PCT => {
                working = difference(&working);
                d += 1;
            }
            _ => break,
        }
    }
    d
}

pub fn psi_weights(ar: &[f64], ma: &[f64], d: usize, count: usize) -> Vec<f64> {
    let mut polynomial = Vec::with_capacity(ar.len() + 1);
    polynomial.push(1.0);
    polynomial.extend(ar.iter().map(|phi| -phi));
    for _ in 0..d {
        let mut next = vec![0.0; polynomial.len() + 1];
        for (i, coefficient) in polynomial.iter().enumerate() {
            next[i] += coefficient;
            next[i + 1] -= coefficient;
        }
        polynomial = next;
    }
    let phi: Vec<f64> = polynomial[1..].iter().map(|c| -c).collect();

    let mut psi = Vec::with_capacity(count);
    for j in 0..count {
        if j == 0 {
            psi.push(1.0);
            continue;
        }
        let mut value = ma.get(j - 1).copied().unwrap_or(0.0);
        for i in 1..=phi.len().min(j) {
            value += phi[i - 1] * psi[j - i];
        }
        psi.push(value);
    }
    psi
}

pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const LOW: f64 = 0.024_25;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };
    if p < LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

fn difference(series: &[f64]) -> Vec<f64> {
    series.windows(2).map(|pair| pair[1] - pair[0]).collect()
}

fn is_constant(series: &[f64]) -> bool {
    series.windows(2).all(|pair| pair[0] == pair[1])
}

fn mean(series: &[f64]) -> f64 {
    series.iter().sum::<f64>() / series.len() as f64
}

fn std_dev(series: &[f64], center: f64) -> f64 {
    let variance =
        series.iter().map(|v| (v - center) * (v - center)).sum::<f64>() / series.len() as f64;
    variance.sqrt()
}
