use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::arima::AutoArimaConfig;
use crate::display::DisplayConfig;
use crate::domain::{Granularity, Source};
use crate::error::PipelineError;

pub const DEFAULT_CONFIG_FILE: &str = "covid-forecast.json";
pub const DEFAULT_HORIZON: usize = 14;

const JHU_SERIES_BASE: &str = "https://raw.githubusercontent.com/CSSEGISandData/COVID-19/master/csse_covid_19_data/csse_covid_19_time_series";
const NYT_BASE: &str = "https://raw.githubusercontent.com/nytimes/covid-19-data/master";
const TRACKER_API: &str = "https://coronavirus-tracker-api.herokuapp.com/v2/locations";
const COUNTY_TABLE: &str =
    "https://raw.githubusercontent.com/jackparmer/mapbox-counties/master/lat_lon_counties.csv";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub horizon: Option<usize>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub calendar_start: Option<NaiveDate>,
    #[serde(default)]
    pub tie_break: Option<TieBreak>,
    #[serde(default)]
    pub feeds: Vec<FeedEntry>,
    #[serde(default)]
    pub reference: Option<ReferenceEntry>,
    #[serde(default)]
    pub manual: BTreeMap<String, ManualOverride>,
    #[serde(default)]
    pub worldwide: Option<bool>,
    #[serde(default)]
    pub model: Option<AutoArimaConfig>,
    #[serde(default)]
    pub display: Option<DisplayConfig>,
    #[serde(default)]
    pub output: Option<OutputEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FeedEntry {
    Shorthand(String),
    Detailed(FeedConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedShape {
    TimelineJson,
    CurrentJson,
    LongCsv,
    WideCsv,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FeedConfig {
    pub name: String,
    pub source: Source,
    pub shape: FeedShape,
    pub url: String,
    #[serde(default)]
    pub deaths_url: Option<String>,
    #[serde(default)]
    pub recovered_url: Option<String>,
    #[serde(default)]
    pub history: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub granularities: Vec<Granularity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TieBreak {
    #[serde(default)]
    pub prefer: Vec<Source>,
}

impl TieBreak {
    pub fn rank(&self, source: &Source) -> usize {
        self.prefer
            .iter()
            .position(|preferred| preferred == source)
            .unwrap_or(self.prefer.len())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReferenceEntry {
    #[serde(default)]
    pub countries: Option<String>,
    #[serde(default)]
    pub counties: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ManualOverride {
    #[serde(default)]
    pub population: Option<u64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OutputEntry {
    #[serde(default)]
    pub dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub archive: Option<bool>,
    #[serde(default)]
    pub archive_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceConfig {
    pub countries: String,
    pub counties: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputConfig {
    pub dir: Option<Utf8PathBuf>,
    pub archive: bool,
    pub archive_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub horizon: usize,
    pub workers: Option<usize>,
    pub calendar_start: Option<NaiveDate>,
    pub tie_break: TieBreak,
    pub feeds: Vec<FeedConfig>,
    pub reference: ReferenceConfig,
    pub manual: BTreeMap<String, ManualOverride>,
    pub worldwide: bool,
    pub model: AutoArimaConfig,
    pub display: DisplayConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub horizon: Option<usize>,
    pub workers: Option<usize>,
    pub output_dir: Option<Utf8PathBuf>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut ResolvedConfig) -> Result<(), PipelineError> {
        if let Some(horizon) = self.horizon {
            if horizon == 0 {
                return Err(PipelineError::InvalidConfig(
                    "horizon must be at least one day".to_string(),
                ));
            }
            config.horizon = horizon;
        }
        if let Some(workers) = self.workers {
            if workers == 0 {
                return Err(PipelineError::InvalidConfig(
                    "workers must be at least 1".to_string(),
                ));
            }
            config.workers = Some(workers);
        }
        if let Some(dir) = self.output_dir {
            config.output.dir = Some(dir);
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PipelineError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !config_path.exists() {
            if path.is_some() {
                return Err(PipelineError::MissingConfig(config_path));
            }
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PipelineError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PipelineError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(PipelineError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let horizon = config.horizon.unwrap_or(DEFAULT_HORIZON);
        if horizon == 0 {
            return Err(PipelineError::InvalidConfig(
                "horizon must be at least one day".to_string(),
            ));
        }
        if config.workers == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }

        let entries = if config.feeds.is_empty() {
            default_feeds()
        } else {
            config.feeds
        };
        let feeds = entries
            .into_iter()
            .map(|entry| match entry {
                FeedEntry::Shorthand(name) => preset_feed(&name),
                FeedEntry::Detailed(feed) => Ok(feed),
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;
        validate_feeds(&feeds)?;

        let reference = match config.reference {
            Some(entry) => ReferenceConfig {
                countries: entry
                    .countries
                    .unwrap_or_else(|| "country_centroids_az8.csv".to_string()),
                counties: entry.counties,
            },
            None => ReferenceConfig {
                countries: "country_centroids_az8.csv".to_string(),
                counties: Some(COUNTY_TABLE.to_string()),
            },
        };

        let mut manual = default_manual_overrides();
        manual.extend(config.manual);

        let model = config.model.unwrap_or_default();
        model.validate()?;
        let display = config.display.unwrap_or_default();
        display.validate()?;

        let output = match config.output {
            Some(entry) => OutputConfig {
                dir: entry.dir,
                archive: entry.archive.unwrap_or(true),
                archive_dir: entry.archive_dir,
            },
            None => OutputConfig {
                dir: None,
                archive: true,
                archive_dir: None,
            },
        };

        Ok(ResolvedConfig {
            schema_version,
            horizon,
            workers: config.workers,
            calendar_start: config.calendar_start,
            tie_break: config.tie_break.unwrap_or_default(),
            feeds,
            reference,
            manual,
            worldwide: config.worldwide.unwrap_or(true),
            model,
            display,
            output,
        })
    }
}

fn validate_feeds(feeds: &[FeedConfig]) -> Result<(), PipelineError> {
    if feeds.is_empty() {
        return Err(PipelineError::InvalidConfig(
            "at least one feed is required".to_string(),
        ));
    }
    let mut names = BTreeSet::new();
    for feed in feeds {
        if !names.insert(feed.name.as_str()) {
            return Err(PipelineError::InvalidConfig(format!(
                "duplicate feed name: {}",
                feed.name
            )));
        }
        if feed.granularities.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "feed {} lists no granularities",
                feed.name
            )));
        }
        if feed.granularities.contains(&Granularity::Worldwide) {
            return Err(PipelineError::InvalidConfig(format!(
                "feed {}: worldwide is derived, not ingested",
                feed.name
            )));
        }
        if feed.shape == FeedShape::WideCsv && feed.deaths_url.is_none() {
            return Err(PipelineError::InvalidConfig(format!(
                "feed {}: wide_csv requires deaths_url",
                feed.name
            )));
        }
        if feed.history.is_some() && feed.shape != FeedShape::CurrentJson {
            return Err(PipelineError::InvalidConfig(format!(
                "feed {}: history is only meaningful for current_json feeds",
                feed.name
            )));
        }
    }
    Ok(())
}

pub fn default_feeds() -> Vec<FeedEntry> {
    vec![
        FeedEntry::Shorthand("jhu-global".to_string()),
        FeedEntry::Shorthand("nyt-states".to_string()),
        FeedEntry::Shorthand("nyt-counties".to_string()),
    ]
}

pub fn preset_feed(name: &str) -> Result<FeedConfig, PipelineError> {
    let feed = match name {
        "jhu-global" => FeedConfig {
            name: name.to_string(),
            source: Source::Jhu,
            shape: FeedShape::WideCsv,
            url: format!("{JHU_SERIES_BASE}/time_series_covid19_confirmed_global.csv"),
            deaths_url: Some(format!(
                "{JHU_SERIES_BASE}/time_series_covid19_deaths_global.csv"
            )),
            recovered_url: Some(format!(
                "{JHU_SERIES_BASE}/time_series_covid19_recovered_global.csv"
            )),
            history: None,
            country: None,
            granularities: vec![Granularity::Country, Granularity::Province],
        },
        "jhu-api" => FeedConfig {
            name: name.to_string(),
            source: Source::Jhu,
            shape: FeedShape::TimelineJson,
            url: format!("{TRACKER_API}?source=jhu&timelines=true"),
            deaths_url: None,
            recovered_url: None,
            history: None,
            country: None,
            granularities: vec![Granularity::Country],
        },
        "csbs-api" => FeedConfig {
            name: name.to_string(),
            source: Source::Csbs,
            shape: FeedShape::CurrentJson,
            url: format!("{TRACKER_API}?source=csbs"),
            deaths_url: None,
            recovered_url: None,
            history: None,
            country: Some("United States".to_string()),
            granularities: vec![Granularity::County],
        },
        "nyt-states" => FeedConfig {
            name: name.to_string(),
            source: Source::NyTimes,
            shape: FeedShape::LongCsv,
            url: format!("{NYT_BASE}/us-states.csv"),
            deaths_url: None,
            recovered_url: None,
            history: None,
            country: Some("United States".to_string()),
            granularities: vec![Granularity::State],
        },
        "nyt-counties" => FeedConfig {
            name: name.to_string(),
            source: Source::NyTimes,
            shape: FeedShape::LongCsv,
            url: format!("{NYT_BASE}/us-counties.csv"),
            deaths_url: None,
            recovered_url: None,
            history: None,
            country: Some("United States".to_string()),
            granularities: vec![Granularity::County],
        },
        other => {
            return Err(PipelineError::InvalidConfig(format!(
                "unknown feed preset: {other}"
            )));
        }
    };
    Ok(feed)
}

pub fn default_manual_overrides() -> BTreeMap<String, ManualOverride> {
    [
        ("Diamond Princess", 2_670),
        ("Kosovo", 1_810_463),
        ("MS Zaandam", 615),
        ("Namibia", 2_190_000),
        ("Western Sahara", 500_000),
    ]
    .into_iter()
    .map(|(name, population)| {
        (
            name.to_string(),
            ManualOverride {
                population: Some(population),
                ..ManualOverride::default()
            },
        )
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_without_feeds() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.horizon, DEFAULT_HORIZON);
        assert_eq!(resolved.feeds.len(), 3);
        assert!(resolved.worldwide);
        assert!(resolved.manual.contains_key("Kosovo"));
    }

    #[test]
    fn zero_horizon_rejected() {
        let config = Config {
            horizon: Some(0),
            ..Config::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(PipelineError::InvalidConfig(_))
        );
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        ConfigOverrides {
            horizon: Some(7),
            workers: Some(2),
            output_dir: Some(Utf8PathBuf::from("/tmp/out")),
        }
        .apply(&mut resolved)
        .unwrap();
        assert_eq!(resolved.horizon, 7);
        assert_eq!(resolved.workers, Some(2));
        assert_eq!(resolved.output.dir, Some(Utf8PathBuf::from("/tmp/out")));

        let zero = ConfigOverrides {
            workers: Some(0),
            ..ConfigOverrides::default()
        };
        assert_matches!(
            zero.apply(&mut resolved),
            Err(PipelineError::InvalidConfig(_))
        );
    }

    #[test]
    fn tie_break_rank_puts_unlisted_last() {
        let tie = TieBreak {
            prefer: vec![Source::Csbs, Source::Jhu],
        };
        assert_eq!(tie.rank(&Source::Csbs), 0);
        assert_eq!(tie.rank(&Source::Jhu), 1);
        assert_eq!(tie.rank(&Source::NyTimes), 2);
    }
}
