use std::collections::HashSet;
use std::fmt;

use crate::error::ConfigError;

/// State and territory FIPS codes served by the ACS 5-year profile:
/// 50 states, DC and Puerto Rico.
const US_STATE_FIPS: &[&str] = &[
    "01", "02", "04", "05", "06", "08", "09", "10", "11", "12", "13", "15", "16", "17", "18",
    "19", "20", "21", "22", "23", "24", "25", "26", "27", "28", "29", "30", "31", "32", "33",
    "34", "35", "36", "37", "38", "39", "40", "41", "42", "44", "45", "46", "47", "48", "49",
    "50", "51", "53", "54", "55", "56", "72",
];

/// A 2-digit state FIPS code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Region(String);

impl Region {
    pub fn parse(code: &str) -> Result<Self, ConfigError> {
        let code = code.trim();
        if code.len() == 2 && code.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Region(code.to_string()))
        } else {
            Err(ConfigError::InvalidRegion(code.to_string()))
        }
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, duplicate-free list of regions a run iterates over.
#[derive(Debug, Clone)]
pub struct RegionCatalog {
    regions: Vec<Region>,
}

impl RegionCatalog {
    pub fn new<I, S>(codes: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut regions = Vec::new();
        for code in codes {
            let region = Region::parse(code.as_ref())?;
            if !seen.insert(region.clone()) {
                return Err(ConfigError::DuplicateRegion(region.0));
            }
            regions.push(region);
        }
        if regions.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }
        Ok(RegionCatalog { regions })
    }

    pub fn us_states() -> Self {
        RegionCatalog {
            regions: US_STATE_FIPS.iter().map(|c| Region(c.to_string())).collect(),
        }
    }

    /// Restrict to `only`, keeping catalog order.
    pub fn filter(&self, only: &[String]) -> Result<Self, ConfigError> {
        if only.is_empty() {
            return Ok(self.clone());
        }
        let mut wanted = HashSet::new();
        for code in only {
            let region = Region::parse(code)?;
            if !self.regions.contains(&region) {
                return Err(ConfigError::UnknownRegion(region.0));
            }
            wanted.insert(region);
        }
        let regions = self
            .regions
            .iter()
            .filter(|r| wanted.contains(*r))
            .cloned()
            .collect();
        Ok(RegionCatalog { regions })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn position(&self, region: &Region) -> Option<usize> {
        self.regions.iter().position(|r| r == region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_covers_states_dc_and_pr() {
        let catalog = RegionCatalog::us_states();
        assert_eq!(catalog.len(), 52);
        let codes: Vec<&str> = catalog.iter().map(Region::code).collect();
        assert!(codes.contains(&"08"));
        assert!(codes.contains(&"11"));
        assert!(codes.contains(&"72"));
        assert!(!codes.contains(&"03"));
        let mut sorted = codes.clone();
        sorted.sort();
        assert_eq!(codes, sorted);
    }

    #[test]
    fn rejects_bad_and_duplicate_codes() {
        assert!(matches!(
            RegionCatalog::new(["8"]),
            Err(ConfigError::InvalidRegion(_))
        ));
        assert!(matches!(
            RegionCatalog::new(["0a"]),
            Err(ConfigError::InvalidRegion(_))
        ));
        assert!(matches!(
            RegionCatalog::new(["08", "08"]),
            Err(ConfigError::DuplicateRegion(_))
        ));
        assert!(matches!(
            RegionCatalog::new(Vec::<String>::new()),
            Err(ConfigError::EmptyCatalog)
        ));
    }

    #[test]
    fn filter_keeps_catalog_order() {
        let catalog = RegionCatalog::us_states();
        let only = vec!["56".to_string(), "08".to_string()];
        let filtered = catalog.filter(&only).unwrap();
        let codes: Vec<&str> = filtered.iter().map(Region::code).collect();
        assert_eq!(codes, vec!["08", "56"]);

        let unknown = vec!["03".to_string()];
        assert!(matches!(
            catalog.filter(&unknown),
            Err(ConfigError::UnknownRegion(_))
        ));
    }
}
