use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub quantiles: Vec<f64>,
    pub sizes: Vec<f64>,
    pub case_colors: Vec<String>,
    pub death_colors: Vec<String>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            quantiles: vec![25.0, 50.0, 75.0],
            sizes: vec![5.0, 10.0, 30.0, 60.0],
            case_colors: ["#808080", "#a19e79", "#c1bd70", "#e0dc63", "#fffd50"]
                .map(String::from)
                .to_vec(),
            death_colors: ["#ffa500", "#ff8c00", "#ff7000", "#ff4e00", "#ff0000"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl DisplayConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |message: &str| Err(PipelineError::InvalidConfig(message.to_string()));
        if self.quantiles.is_empty() {
            return invalid("display.quantiles must not be empty");
        }
        if self
            .quantiles
            .iter()
            .any(|q| !(*q > 0.0 && *q < 100.0))
            || self.quantiles.windows(2).any(|pair| pair[0] >= pair[1])
        {
            return invalid("display.quantiles must be increasing percentiles between 0 and 100");
        }
        let buckets = self.quantiles.len() + 1;
        if self.sizes.len() != buckets {
            return invalid("display.sizes needs one entry per bucket");
        }
        if self.case_colors.len() < buckets || self.death_colors.len() < buckets {
            return invalid("display colors need at least one entry per bucket");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketScale {
    edges: Vec<f64>,
    sizes: Vec<f64>,
    colors: Vec<String>,
    labels: Vec<String>,
}

impl BucketScale {
    pub fn from_values(values: &[f64], quantiles: &[f64], sizes: &[f64], colors: &[String]) -> Self {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);
        let edges: Vec<f64> = quantiles.iter().map(|q| percentile(&sorted, *q)).collect();
        let labels = range_labels(&edges);
        Self {
            edges,
            sizes: sizes.to_vec(),
            colors: colors.iter().take(sizes.len()).cloned().collect(),
            labels,
        }
    }

    /// Index of the first bucket whose upper edge is at least `value`.
    pub fn bucket(&self, value: f64) -> usize {
        self.edges
            .iter()
            .position(|edge| value <= *edge)
            .unwrap_or(self.edges.len())
    }

    pub fn size(&self, bucket: usize) -> f64 {
        self.sizes[bucket.min(self.sizes.len() - 1)]
    }

    pub fn color(&self, bucket: usize) -> &str {
        &self.colors[bucket.min(self.colors.len() - 1)]
    }

    pub fn label(&self, bucket: usize) -> &str {
        &self.labels[bucket.min(self.labels.len() - 1)]
    }
}

fn range_labels(edges: &[f64]) -> Vec<String> {
    let mut labels = Vec::with_capacity(edges.len() + 1);
    let mut lower = 0.0;
    for edge in edges {
        labels.push(format!("{}-{}", format_count(lower), format_count(*edge)));
        lower = *edge;
    }
    labels.push(format!("{}+", format_count(lower)));
    labels
}

pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted {
        [] => 0.0,
        [only] => *only,
        _ => {
            let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
            let low = rank.floor() as usize;
            let high = rank.ceil() as usize;
            let fraction = rank - low as f64;
            sorted[low] + (sorted[high] - sorted[low]) * fraction
        }
    }
}

pub fn format_count(value: f64) -> String {
    let rounded = value.round();
    let digits = format!("{:.0}", rounded.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if rounded < 0.0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

pub fn hover_text(name: &str, noun: &str, value: f64, forecast: bool) -> String {
    let prefix = if forecast { "Predicted" } else { "Total" };
    format!("{name}<br>{prefix} {noun}: {}", format_count(value))
}
