use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::regions::RegionCatalog;
use crate::schema::{FieldSpec, SchemaMapping};

pub const DEFAULT_GEOGRAPHY: &str = "place:*";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const MAX_ATTEMPTS_LIMIT: u32 = 5;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 90;
pub const MAX_CONCURRENCY: usize = 8;

/// Environment overrides use `PLACES__SECTION__KEY`, e.g. `PLACES__CONCURRENCY=2`.
const ENV_PREFIX: &str = "PLACES";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vintage {
    pub acs_year: u16,
    pub boundary_year: u16,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinKeyRule {
    #[serde(default = "default_join_key_name")]
    pub name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for JoinKeyRule {
    fn default() -> Self {
        let mut extra = BTreeMap::new();
        extra.insert("parts".into(), serde_json::json!(["state", "place"]));
        extra.insert("widths".into(), serde_json::json!([2, 5]));
        JoinKeyRule {
            name: default_join_key_name(),
            extra,
        }
    }
}

fn default_join_key_name() -> String {
    "GEOID".into()
}

/// Where the geometry for this dataset lives. Only echoed into the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PmtilesBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(
        rename = "promoteId",
        alias = "promoteid",
        skip_serializing_if = "Option::is_none"
    )]
    pub promote_id: Option<String>,
}

impl PmtilesBlock {
    pub fn is_empty(&self) -> bool {
        self.file.is_none() && self.url.is_none() && self.layer.is_none() && self.promote_id.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct RawCensusApi {
    base_url: String,
    #[serde(rename = "for")]
    geography: Option<String>,
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    timeout_secs: Option<u64>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOutputs {
    dist_dir: Option<PathBuf>,
    attrs_dir: PathBuf,
    attrs_filename_template: String,
    manifest: PathBuf,
    pmtiles_places_file: Option<String>,
    pmtiles_places_url: Option<String>,
    pmtiles_places_layer: Option<String>,
    #[serde(rename = "pmtiles_places_promoteId", alias = "pmtiles_places_promoteid")]
    pmtiles_places_promote_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    vintage: Vintage,
    #[serde(default)]
    join_key: Option<JoinKeyRule>,
    census_api: RawCensusApi,
    fields: Vec<FieldSpec>,
    outputs: RawOutputs,
    #[serde(default)]
    pmtiles: Option<PmtilesBlock>,
    #[serde(default)]
    regions: Option<Vec<String>>,
    #[serde(default)]
    concurrency: Option<usize>,
}

#[derive(Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub geography: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
    pub api_key: Option<String>,
}

impl fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSettings")
            .field("base_url", &self.base_url)
            .field("geography", &self.geography)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("timeout", &self.timeout)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub dist_dir: Option<PathBuf>,
    pub attrs_dir: PathBuf,
    pub filename_template: String,
    pub manifest: PathBuf,
}

/// Fully resolved, validated run configuration. Read-only once built.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub vintage: Vintage,
    pub join_key: JoinKeyRule,
    pub api: ApiSettings,
    pub schema: SchemaMapping,
    pub outputs: OutputPaths,
    pub pmtiles: PmtilesBlock,
    pub catalog: RegionCatalog,
    pub concurrency: usize,
}

impl PipelineConfig {
    /// Load a JSON config file, layering `PLACES__*` environment overrides on top.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Json))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Load {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::from_raw(raw)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = Config::builder()
            .add_source(File::from_str(json, FileFormat::Json))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Load {
                path: PathBuf::from("<inline>"),
                message: e.to_string(),
            })?;
        Self::from_raw(raw)
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        if let Some(key) = key.filter(|k| !k.trim().is_empty()) {
            self.api.api_key = Some(key);
        }
        self
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let schema = SchemaMapping::from_fields(&raw.fields)?;

        let catalog = match &raw.regions {
            Some(codes) => RegionCatalog::new(codes)?,
            None => RegionCatalog::us_states(),
        };

        let base_url = raw.census_api.base_url.trim().to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "census_api.base_url",
                message: format!("expected an http(s) URL, got {base_url:?}"),
            });
        }

        let max_attempts = raw.census_api.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&max_attempts) {
            return Err(ConfigError::Invalid {
                field: "census_api.max_attempts",
                message: format!("must be between 1 and {MAX_ATTEMPTS_LIMIT}, got {max_attempts}"),
            });
        }

        let concurrency = raw.concurrency.unwrap_or(1);
        if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(ConfigError::Invalid {
                field: "concurrency",
                message: format!("must be between 1 and {MAX_CONCURRENCY}, got {concurrency}"),
            });
        }

        let template = raw.outputs.attrs_filename_template;
        if !template.contains("{state}") {
            return Err(ConfigError::FilenameTemplate(template));
        }

        let pmtiles = match raw.pmtiles {
            Some(block) if !block.is_empty() => block,
            _ => PmtilesBlock {
                file: raw.outputs.pmtiles_places_file,
                url: raw.outputs.pmtiles_places_url,
                layer: raw.outputs.pmtiles_places_layer,
                promote_id: raw.outputs.pmtiles_places_promote_id,
            },
        };

        Ok(PipelineConfig {
            vintage: raw.vintage,
            join_key: raw.join_key.unwrap_or_default(),
            api: ApiSettings {
                base_url,
                geography: raw
                    .census_api
                    .geography
                    .unwrap_or_else(|| DEFAULT_GEOGRAPHY.to_string()),
                max_attempts,
                base_delay: Duration::from_millis(
                    raw.census_api.base_delay_ms.unwrap_or(DEFAULT_BASE_DELAY_MS),
                ),
                timeout: Duration::from_secs(
                    raw.census_api.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
                ),
                api_key: raw.census_api.key.filter(|k| !k.trim().is_empty()),
            },
            schema,
            outputs: OutputPaths {
                dist_dir: raw.outputs.dist_dir,
                attrs_dir: raw.outputs.attrs_dir,
                filename_template: template,
                manifest: raw.outputs.manifest,
            },
            pmtiles,
            catalog,
            concurrency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"{
        "vintage": { "acs_year": 2023, "boundary_year": 2023, "acs_dataset": "acs5/profile" },
        "census_api": { "base_url": "https://api.census.gov/data/2023/acs/acs5/profile" },
        "fields": [
            { "var": "DP05_0001E", "key": "total_pop", "type": "int" },
            { "var": "DP03_0062E", "key": "median_hh_income", "type": "int", "unit": "USD" }
        ],
        "outputs": {
            "attrs_dir": "dist/attrs",
            "attrs_filename_template": "places_attrs_{state}.json",
            "manifest": "dist/manifest.json",
            "pmtiles_places_url": "https://tiles.example.com/places.pmtiles",
            "pmtiles_places_layer": "places"
        }
    }"#;

    #[test]
    fn applies_defaults() {
        let cfg = PipelineConfig::from_json_str(BASE).unwrap();
        assert_eq!(cfg.vintage.acs_year, 2023);
        assert_eq!(cfg.vintage.extra["acs_dataset"], "acs5/profile");
        assert_eq!(cfg.api.geography, "place:*");
        assert_eq!(cfg.api.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(cfg.api.timeout, Duration::from_secs(90));
        assert_eq!(cfg.catalog.len(), 52);
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.join_key.name, "GEOID");
        assert_eq!(cfg.schema.variables().len(), 2);
    }

    #[test]
    fn pmtiles_falls_back_to_outputs() {
        let cfg = PipelineConfig::from_json_str(BASE).unwrap();
        assert_eq!(
            cfg.pmtiles.url.as_deref(),
            Some("https://tiles.example.com/places.pmtiles")
        );
        assert_eq!(cfg.pmtiles.layer.as_deref(), Some("places"));
        assert!(cfg.pmtiles.file.is_none());
    }

    #[test]
    fn template_without_state_placeholder_is_rejected() {
        let json = BASE.replace("places_attrs_{state}.json", "places_attrs.json");
        assert!(matches!(
            PipelineConfig::from_json_str(&json),
            Err(ConfigError::FilenameTemplate(_))
        ));
    }

    #[test]
    fn attempts_out_of_range_is_rejected() {
        let json = BASE.replace(
            r#""base_url": "https://api.census.gov/data/2023/acs/acs5/profile""#,
            r#""base_url": "https://api.census.gov/data/2023/acs/acs5/profile", "max_attempts": 9"#,
        );
        assert!(matches!(
            PipelineConfig::from_json_str(&json),
            Err(ConfigError::Invalid { field: "census_api.max_attempts", .. })
        ));
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let cfg = PipelineConfig::from_json_str(BASE)
            .unwrap()
            .with_api_key(Some("secret-key".into()));
        let dbg = format!("{:?}", cfg.api);
        assert!(!dbg.contains("secret-key"));
        assert!(dbg.contains("<redacted>"));
    }
}
