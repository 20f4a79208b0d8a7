use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Country,
    Province,
    State,
    County,
    Worldwide,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Country => "country",
            Granularity::Province => "province",
            Granularity::State => "state",
            Granularity::County => "county",
            Granularity::Worldwide => "worldwide",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "country" => Ok(Granularity::Country),
            "province" => Ok(Granularity::Province),
            "state" => Ok(Granularity::State),
            "county" => Ok(Granularity::County),
            "worldwide" => Ok(Granularity::Worldwide),
            _ => Err(PipelineError::InvalidConfig(format!(
                "unknown granularity: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Source {
    Jhu,
    Csbs,
    NyTimes,
    Other(String),
}

impl Source {
    pub fn as_str(&self) -> &str {
        match self {
            Source::Jhu => "jhu",
            Source::Csbs => "csbs",
            Source::NyTimes => "nytimes",
            Source::Other(name) => name,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" => Err(PipelineError::InvalidConfig("empty source name".to_string())),
            "jhu" => Ok(Source::Jhu),
            "csbs" => Ok(Source::Csbs),
            "nytimes" | "nyt" => Ok(Source::NyTimes),
            _ => Ok(Source::Other(normalized)),
        }
    }
}

impl TryFrom<String> for Source {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Source> for String {
    fn from(value: Source) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "granularity", rename_all = "lowercase")]
pub enum EntityRef {
    Worldwide,
    Country {
        country: String,
    },
    Province {
        province: String,
        country: String,
    },
    State {
        state: String,
        country: String,
    },
    County {
        county: String,
        state: Option<String>,
        country: String,
    },
}

impl EntityRef {
    pub fn granularity(&self) -> Granularity {
        match self {
            EntityRef::Worldwide => Granularity::Worldwide,
            EntityRef::Country { .. } => Granularity::Country,
            EntityRef::Province { .. } => Granularity::Province,
            EntityRef::State { .. } => Granularity::State,
            EntityRef::County { .. } => Granularity::County,
        }
    }

    pub fn country(&self) -> Option<&str> {
        match self {
            EntityRef::Worldwide => None,
            EntityRef::Country { country }
            | EntityRef::Province { country, .. }
            | EntityRef::State { country, .. }
            | EntityRef::County { country, .. } => Some(country),
        }
    }

    pub fn region(&self) -> Option<&str> {
        match self {
            EntityRef::Province { province, .. } => Some(province),
            EntityRef::State { state, .. } => Some(state),
            EntityRef::County { state, .. } => state.as_deref(),
            EntityRef::Worldwide | EntityRef::Country { .. } => None,
        }
    }

    pub fn county(&self) -> Option<&str> {
        match self {
            EntityRef::County { county, .. } => Some(county),
            _ => None,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            EntityRef::Worldwide => "Worldwide".to_string(),
            EntityRef::Country { country } => country.clone(),
            EntityRef::Province { province, country } => format!("{province}, {country}"),
            EntityRef::State { state, country } => format!("{state}, {country}"),
            EntityRef::County {
                county,
                state: Some(state),
                ..
            } => format!("{county}, {state}"),
            EntityRef::County {
                county,
                state: None,
                country,
            } => format!("{county}, {country}"),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.granularity())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub source: Source,
    pub country: String,
    pub country_code: Option<String>,
    pub province: Option<String>,
    pub county: Option<String>,
    pub fips: Option<u32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub date: NaiveDate,
    pub updated_at: Option<DateTime<Utc>>,
    pub confirmed: u64,
    pub deaths: u64,
    pub recovered: Option<u64>,
}

impl RawObservation {
    pub fn new(source: Source, country: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            source,
            country: country.into(),
            country_code: None,
            province: None,
            county: None,
            fips: None,
            latitude: None,
            longitude: None,
            date,
            updated_at: None,
            confirmed: 0,
            deaths: 0,
            recovered: None,
        }
    }

    pub fn with_counts(mut self, confirmed: u64, deaths: u64) -> Self {
        self.confirmed = confirmed;
        self.deaths = deaths;
        self
    }

    pub fn with_province(mut self, province: impl Into<String>) -> Self {
        self.province = non_empty(province.into());
        self
    }

    pub fn with_county(mut self, county: impl Into<String>) -> Self {
        self.county = non_empty(county.into());
        self
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoOrigin {
    Reference,
    Manual,
    Observed,
    Derived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub population: Option<u64>,
    pub origin: InfoOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, PipelineError> {
        if start > end {
            return Err(PipelineError::EmptyDataset(format!(
                "calendar start {start} is after the latest observation {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn num_days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take(self.num_days())
    }
}

pub fn days_after(date: NaiveDate, n: usize) -> Vec<NaiveDate> {
    (1..=n as u64)
        .filter_map(|offset| date.checked_add_days(Days::new(offset)))
        .collect()
}

pub fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn granularity_follows_variant() {
        let county = EntityRef::County {
            county: "Kings".to_string(),
            state: Some("New York".to_string()),
            country: "United States".to_string(),
        };
        assert_eq!(county.granularity(), Granularity::County);
        assert_eq!(county.display_name(), "Kings, New York");
        assert_eq!(county.region(), Some("New York"));
        assert_eq!(EntityRef::Worldwide.granularity(), Granularity::Worldwide);
    }

    #[test]
    fn worldwide_sorts_first() {
        let country = EntityRef::Country {
            country: "Albania".to_string(),
        };
        assert!(EntityRef::Worldwide < country);
    }

    #[test]
    fn parse_source_aliases() {
        assert_eq!("NYT".parse::<Source>().unwrap(), Source::NyTimes);
        assert_eq!(
            "covidtracking".parse::<Source>().unwrap(),
            Source::Other("covidtracking".to_string())
        );
        assert_matches!("  ".parse::<Source>(), Err(PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn date_range_length_is_inclusive() {
        let start = NaiveDate::from_ymd_opt(2020, 1, 22).unwrap();
        let end = NaiveDate::from_ymd_opt(2020, 1, 31).unwrap();
        let range = DateRange::new(start, end).unwrap();
        assert_eq!(range.num_days(), 10);
        assert_eq!(range.days().last(), Some(end));
        assert!(DateRange::new(end, start).is_err());
    }

    #[test]
    fn empty_strings_become_absent() {
        assert_eq!(non_empty("  ".to_string()), None);
        assert_eq!(non_empty(" Hubei ".to_string()), Some("Hubei".to_string()));
    }
}
