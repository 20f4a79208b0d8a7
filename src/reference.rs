use std::collections::HashMap;

use serde::Deserialize;
use tracing::info;

use crate::config::ReferenceConfig;
use crate::error::PipelineError;
use crate::feeds::FeedClient;
use crate::ingest::fips_code;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    pub latitude: f64,
    pub longitude: f64,
    pub population: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    countries_by_code: HashMap<String, Centroid>,
    countries_by_name: HashMap<String, Centroid>,
    counties_by_fips: HashMap<u32, Centroid>,
    counties_by_name: HashMap<(String, String), Centroid>,
    states_by_name: HashMap<String, Centroid>,
}

#[derive(Debug, Deserialize)]
struct CountryRow {
    #[serde(rename = "iso_a2")]
    iso_a2: String,
    #[serde(rename = "Latitude", alias = "latitude")]
    latitude: f64,
    #[serde(rename = "Longitude", alias = "longitude")]
    longitude: f64,
    #[serde(default)]
    pop_est: Option<f64>,
    #[serde(default, alias = "name")]
    admin: Option<String>,
}

impl ReferenceTable {
    pub fn load<F: FeedClient + ?Sized>(
        client: &F,
        config: &ReferenceConfig,
    ) -> Result<Self, PipelineError> {
        let mut table = Self::default();
        let countries = client.fetch(&config.countries)?;
        table.add_countries(&config.countries, &countries)?;
        if let Some(location) = &config.counties {
            let counties = client.fetch(location)?;
            table.add_counties(location, &counties)?;
        }
        info!(
            countries = table.countries_by_code.len(),
            counties = table.counties_by_fips.len(),
            states = table.states_by_name.len(),
            "loaded reference tables"
        );
        Ok(table)
    }

    pub fn add_countries(&mut self, location: &str, payload: &[u8]) -> Result<(), PipelineError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(payload);
        for record in reader.deserialize::<CountryRow>() {
            let row = record.map_err(|err| PipelineError::Reference {
                location: location.to_string(),
                message: err.to_string(),
            })?;
            let centroid = Centroid {
                latitude: row.latitude,
                longitude: row.longitude,
                population: positive(row.pop_est),
            };
            let code = row.iso_a2.trim().to_ascii_uppercase();
            // Natural Earth marks unassigned codes as -99.
            if !code.is_empty() && code != "-99" {
                self.countries_by_code.insert(code, centroid);
            }
            if let Some(name) = row.admin.filter(|name| !name.trim().is_empty()) {
                self.countries_by_name.insert(name.trim().to_string(), centroid);
            }
        }
        Ok(())
    }

    pub fn add_counties(&mut self, location: &str, payload: &[u8]) -> Result<(), PipelineError> {
        let reference_err = |message: String| PipelineError::Reference {
            location: location.to_string(),
            message,
        };
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(payload);
        let headers: Vec<String> = reader
            .headers()
            .map_err(|err| reference_err(err.to_string()))?
            .iter()
            .map(|header| header.trim().to_string())
            .collect();
        let column = |name: &str| {
            headers
                .iter()
                .position(|header| header.eq_ignore_ascii_case(name))
                .ok_or_else(|| reference_err(format!("missing column {name}")))
        };
        let fips_col = column("FIPS")?;
        let state_col = column("State")?;
        let lat_col = column("Latitude")?;
        let lon_col = column("Longitude")?;
        let pop_col = column("Population(2010)")?;
        let name_col = headers
            .iter()
            .position(|header| header.eq_ignore_ascii_case("County"));

        let mut per_state: HashMap<String, (f64, f64, u64, usize)> = HashMap::new();
        for record in reader.records() {
            let record = record.map_err(|err| reference_err(err.to_string()))?;
            let number = |index: usize| {
                record
                    .get(index)
                    .map(|value| value.replace(',', ""))
                    .and_then(|value| value.trim().parse::<f64>().ok())
            };
            let (Some(fips), Some(latitude), Some(longitude)) = (
                number(fips_col).and_then(|value| fips_code(location, value)),
                number(lat_col),
                number(lon_col),
            )
            else {
                continue;
            };
            let population = positive(number(pop_col));
            let centroid = Centroid {
                latitude,
                longitude,
                population,
            };
            self.counties_by_fips.insert(fips, centroid);

            let state_code = record.get(state_col).unwrap_or_default().trim();
            let Some(state_name) = state_name(state_code) else {
                continue;
            };
            if let Some(county) = name_col.and_then(|index| record.get(index)) {
                let county = county.trim().trim_end_matches(" County").to_string();
                self.counties_by_name
                    .insert((county, state_name.to_string()), centroid);
            }
            let entry = per_state
                .entry(state_name.to_string())
                .or_insert((0.0, 0.0, 0, 0));
            entry.0 += latitude;
            entry.1 += longitude;
            entry.2 += population.unwrap_or(0);
            entry.3 += 1;
        }

        for (state, (lat_sum, lon_sum, population, count)) in per_state {
            self.states_by_name.insert(
                state,
                Centroid {
                    latitude: lat_sum / count as f64,
                    longitude: lon_sum / count as f64,
                    population: (population > 0).then_some(population),
                },
            );
        }
        Ok(())
    }

    pub fn country(&self, code: Option<&str>, name: &str) -> Option<Centroid> {
        code.or_else(|| country_code(name))
            .and_then(|code| self.countries_by_code.get(&code.to_ascii_uppercase()))
            .or_else(|| self.countries_by_name.get(name))
            .copied()
    }

    pub fn state(&self, name: &str) -> Option<Centroid> {
        self.states_by_name.get(name).copied()
    }

    pub fn county(&self, fips: Option<u32>, county: &str, state: Option<&str>) -> Option<Centroid> {
        fips.and_then(|fips| self.counties_by_fips.get(&fips))
            .or_else(|| {
                state.and_then(|state| {
                    self.counties_by_name
                        .get(&(county.to_string(), state.to_string()))
                })
            })
            .copied()
    }
}

fn positive(value: Option<f64>) -> Option<u64> {
    value
        .filter(|population| population.is_finite() && *population > 0.0)
        .map(|population| population.round() as u64)
}

pub fn country_code(name: &str) -> Option<&'static str> {
    COUNTRY_CODES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, code)| *code)
}

// JHU CSSE spellings.
const COUNTRY_CODES: &[(&str, &str)] = &[
    ("Antigua and Barbuda", "AG"),
    ("Bahamas", "BS"),
    ("Bolivia", "BO"),
    ("Bosnia and Herzegovina", "BA"),
    ("Brunei", "BN"),
    ("Burma", "MM"),
    ("Cabo Verde", "CV"),
    ("Central African Republic", "CF"),
    ("Congo (Brazzaville)", "CG"),
    ("Congo (Kinshasa)", "CD"),
    ("Cote d'Ivoire", "CI"),
    ("Czechia", "CZ"),
    ("Dominican Republic", "DO"),
    ("Equatorial Guinea", "GQ"),
    ("Eswatini", "SZ"),
    ("Gambia", "GM"),
    ("Guinea-Bissau", "GW"),
    ("Holy See", "VA"),
    ("Iran", "IR"),
    ("Korea, North", "KP"),
    ("Korea, South", "KR"),
    ("Laos", "LA"),
    ("Micronesia", "FM"),
    ("Moldova", "MD"),
    ("North Macedonia", "MK"),
    ("Russia", "RU"),
    ("Saint Kitts and Nevis", "KN"),
    ("Saint Lucia", "LC"),
    ("Saint Vincent and the Grenadines", "VC"),
    ("Sao Tome and Principe", "ST"),
    ("Serbia", "RS"),
    ("South Sudan", "SS"),
    ("Syria", "SY"),
    ("Taiwan*", "TW"),
    ("Tanzania", "TZ"),
    ("Timor-Leste", "TL"),
    ("US", "US"),
    ("United Kingdom", "GB"),
    ("Venezuela", "VE"),
    ("Vietnam", "VN"),
    ("West Bank and Gaza", "PS"),
];

const STATE_NAMES: &[(&str, &str)] = &[
    ("AK", "Alaska"),
    ("AL", "Alabama"),
    ("AR", "Arkansas"),
    ("AS", "American Samoa"),
    ("AZ", "Arizona"),
    ("CA", "California"),
    ("CO", "Colorado"),
    ("CT", "Connecticut"),
    ("DC", "District of Columbia"),
    ("DE", "Delaware"),
    ("FL", "Florida"),
    ("GA", "Georgia"),
    ("GU", "Guam"),
    ("HI", "Hawaii"),
    ("IA", "Iowa"),
    ("ID", "Idaho"),
    ("IL", "Illinois"),
    ("IN", "Indiana"),
    ("KS", "Kansas"),
    ("KY", "Kentucky"),
    ("LA", "Louisiana"),
    ("MA", "Massachusetts"),
    ("MD", "Maryland"),
    ("ME", "Maine"),
    ("MI", "Michigan"),
    ("MN", "Minnesota"),
    ("MO", "Missouri"),
    ("MP", "Northern Mariana Islands"),
    ("MS", "Mississippi"),
    ("MT", "Montana"),
    ("NC", "North Carolina"),
    ("ND", "North Dakota"),
    ("NE", "Nebraska"),
    ("NH", "New Hampshire"),
    ("NJ", "New Jersey"),
    ("NM", "New Mexico"),
    ("NV", "Nevada"),
    ("NY", "New York"),
    ("OH", "Ohio"),
    ("OK", "Oklahoma"),
    ("OR", "Oregon"),
    ("PA", "Pennsylvania"),
    ("PR", "Puerto Rico"),
    ("RI", "Rhode Island"),
    ("SC", "South Carolina"),
    ("SD", "South Dakota"),
    ("TN", "Tennessee"),
    ("TX", "Texas"),
    ("UT", "Utah"),
    ("VA", "Virginia"),
    ("VI", "Virgin Islands"),
    ("VT", "Vermont"),
    ("WA", "Washington"),
    ("WI", "Wisconsin"),
    ("WV", "West Virginia"),
    ("WY", "Wyoming"),
];

pub fn state_name(code: &str) -> Option<&'static str> {
    let code = code.trim();
    STATE_NAMES
        .iter()
        .find(|(abbr, _)| abbr.eq_ignore_ascii_case(code))
        .map(|(_, name)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTIES: &str = "\
,FIPS,County,State,Latitude,Longitude,Population(2010)
0,36047,Kings County,NY,40.63,-73.95,\"2,504,700\"
1,36061,New York County,NY,40.78,-73.97,\"1,585,873\"
2,6037,Los Angeles County,CA,34.05,-118.24,\"9,818,605\"
";

    #[test]
    fn states_are_derived_from_counties() {
        let mut table = ReferenceTable::default();
        table.add_counties("counties.csv", COUNTIES.as_bytes()).unwrap();

        let new_york = table.state("New York").unwrap();
        assert_eq!(new_york.population, Some(4_090_573));
        assert!((new_york.latitude - 40.705).abs() < 1e-9);

        let kings = table.county(Some(36047), "Kings", Some("New York")).unwrap();
        assert_eq!(kings.population, Some(2_504_700));
        let by_name = table.county(None, "Los Angeles", Some("California")).unwrap();
        assert_eq!(by_name.population, Some(9_818_605));
    }

    #[test]
    fn country_lookup_ignores_negative_population() {
        let csv = "iso_a2,admin,Latitude,Longitude,pop_est\nXK,Kosovo,42.6,20.9,-99\nCN,China,35.0,103.0,1379302771\n";
        let mut table = ReferenceTable::default();
        table.add_countries("countries.csv", csv.as_bytes()).unwrap();

        assert_eq!(table.country(Some("xk"), "Kosovo").unwrap().population, None);
        assert_eq!(
            table.country(None, "China").unwrap().population,
            Some(1_379_302_771)
        );
        assert!(table.country(Some("ZZ"), "Atlantis").is_none());
    }

    #[test]
    fn postal_codes_expand() {
        assert_eq!(state_name("ny"), Some("New York"));
        assert_eq!(state_name("ZZ"), None);
    }
}
