//! Run manifest: the one document that says what a run produced.
//!
//! Written last, after every region has finished. Its presence is the signal
//! that a run completed; consumers should ignore attrs files that the current
//! manifest does not list.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::config::{JoinKeyRule, PipelineConfig, PmtilesBlock, Vintage};
use crate::error::WriteError;
use crate::pipeline::{RegionOutcome, RegionResult};
use crate::schema::AttributeVariable;
use crate::writer::write_atomic;

pub const DATASET: &str = "us_census_places_acs_profile";
pub const ATTRS_FORMAT: &str = "geoid_keyed_object";

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub dataset: String,
    pub generated_at: String,
    pub vintage: Vintage,
    pub sources: Sources,
    pub pmtiles: PmtilesBlock,
    pub attrs: AttrsBlock,
    pub schema: SchemaBlock,
    pub totals: Totals,
    pub failures: Vec<FailedRegion>,
    pub partial: Vec<PartialRegion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sources {
    pub acs_api_base_url: String,
    pub geography: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttrsBlock {
    pub format: &'static str,
    pub by_state: bool,
    pub attrs_dir: String,
    pub filename_template: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub statefp: String,
    pub file: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaBlock {
    pub join_key: JoinKeyRule,
    pub fields: Vec<AttributeVariable>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub regions_attempted: usize,
    pub regions_succeeded: usize,
    pub regions_failed: usize,
    pub regions_partial: usize,
    pub rows_received: usize,
    pub records_written: usize,
    pub rows_skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedRegion {
    pub statefp: String,
    pub stage: &'static str,
    pub error: String,
    pub count: usize,
}

/// A region that was written but dropped some rows.
#[derive(Debug, Clone, Serialize)]
pub struct PartialRegion {
    pub statefp: String,
    pub skipped_rows: usize,
    pub reasons: BTreeMap<&'static str, usize>,
}

pub fn build_manifest(
    results: &[RegionResult],
    config: &PipelineConfig,
    generated_at: DateTime<Utc>,
) -> Manifest {
    let mut totals = Totals {
        regions_attempted: results.len(),
        ..Totals::default()
    };
    let mut files = Vec::new();
    let mut failures = Vec::new();
    let mut partial = Vec::new();

    for result in results {
        let statefp = result.region.code().to_string();
        match &result.outcome {
            RegionOutcome::Done(summary) => {
                totals.regions_succeeded += 1;
                totals.rows_received += summary.rows_received;
                totals.records_written += summary.records;
                totals.rows_skipped += summary.skipped.len();

                files.push(FileEntry {
                    statefp: statefp.clone(),
                    file: summary.file.to_string_lossy().replace('\\', "/"),
                    count: summary.records,
                });

                if !summary.skipped.is_empty() {
                    totals.regions_partial += 1;
                    let mut reasons = BTreeMap::new();
                    for e in &summary.skipped {
                        *reasons.entry(e.kind()).or_insert(0) += 1;
                    }
                    partial.push(PartialRegion {
                        statefp,
                        skipped_rows: summary.skipped.len(),
                        reasons,
                    });
                }
            }
            RegionOutcome::Failed(error) => {
                totals.regions_failed += 1;
                failures.push(FailedRegion {
                    statefp,
                    stage: error.stage(),
                    error: error.to_string(),
                    count: 0,
                });
            }
        }
    }

    Manifest {
        dataset: DATASET.to_string(),
        generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        vintage: config.vintage.clone(),
        sources: Sources {
            acs_api_base_url: config.api.base_url.clone(),
            geography: config.api.geography.clone(),
        },
        pmtiles: config.pmtiles.clone(),
        attrs: AttrsBlock {
            format: ATTRS_FORMAT,
            by_state: true,
            attrs_dir: config.outputs.attrs_dir.to_string_lossy().replace('\\', "/"),
            filename_template: config.outputs.filename_template.clone(),
            files,
        },
        schema: SchemaBlock {
            join_key: config.join_key.clone(),
            fields: config.schema.variables().to_vec(),
        },
        totals,
        failures,
        partial,
    }
}

/// Replace the manifest at `path` wholesale.
pub fn write_manifest(manifest: &Manifest, path: &Path) -> Result<(), WriteError> {
    let mut bytes = serde_json::to_vec_pretty(manifest).map_err(|e| WriteError {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    bytes.push(b'\n');
    write_atomic(path, &bytes).map_err(|source| WriteError {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::TimeZone;

    use super::*;
    use crate::error::{FetchError, RegionError, RowError};
    use crate::pipeline::RegionSummary;
    use crate::regions::Region;

    fn config() -> PipelineConfig {
        PipelineConfig::from_json_str(
            r#"{
                "vintage": { "acs_year": 2023, "boundary_year": 2024 },
                "census_api": { "base_url": "https://api.census.gov/data/2023/acs/acs5/profile" },
                "fields": [ { "var": "DP03_0062E", "key": "median_hh_income", "type": "int" } ],
                "outputs": {
                    "attrs_dir": "dist/attrs",
                    "attrs_filename_template": "places_attrs_{state}.json",
                    "manifest": "dist/manifest.json"
                },
                "pmtiles": { "url": "https://tiles.example.com/places.pmtiles", "layer": "places" }
            }"#,
        )
        .unwrap()
    }

    fn done(code: &str, records: usize, skipped: Vec<RowError>) -> RegionResult {
        RegionResult {
            region: Region::parse(code).unwrap(),
            outcome: RegionOutcome::Done(RegionSummary {
                file: PathBuf::from(format!("dist/attrs/places_attrs_{code}.json")),
                records,
                rows_received: records + skipped.len(),
                skipped,
            }),
        }
    }

    fn failed(code: &str) -> RegionResult {
        RegionResult {
            region: Region::parse(code).unwrap(),
            outcome: RegionOutcome::Failed(RegionError::Fetch(FetchError::RetriesExhausted {
                attempts: 4,
                last: Box::new(FetchError::Server { status: 503 }),
            })),
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn totals_add_up() {
        let results = vec![
            done("08", 271, vec![]),
            failed("11"),
            done("56", 99, vec![RowError::MissingKey("place"), RowError::MissingKey("place")]),
        ];
        let m = build_manifest(&results, &config(), at());

        let per_region: usize = results.iter().map(RegionResult::record_count).sum();
        assert_eq!(m.totals.records_written, per_region);
        assert_eq!(m.totals.records_written, 370);
        assert_eq!(m.totals.regions_attempted, 3);
        assert_eq!(m.totals.regions_succeeded, 2);
        assert_eq!(m.totals.regions_failed, 1);
        assert_eq!(m.totals.regions_partial, 1);
        assert_eq!(m.totals.rows_skipped, 2);

        assert_eq!(m.failures.len(), 1);
        assert_eq!(m.failures[0].statefp, "11");
        assert_eq!(m.failures[0].stage, "fetch");
        assert_eq!(m.failures[0].count, 0);
        assert!(m.attrs.files.iter().all(|f| f.statefp != "11"));

        assert_eq!(m.partial[0].statefp, "56");
        assert_eq!(m.partial[0].reasons["missing_key"], 2);
    }

    #[test]
    fn all_failed_is_still_a_manifest() {
        let m = build_manifest(&[failed("08"), failed("56")], &config(), at());
        assert_eq!(m.totals.records_written, 0);
        assert_eq!(m.totals.regions_succeeded, 0);
        assert_eq!(m.failures.len(), 2);
        assert!(m.attrs.files.is_empty());
    }

    #[test]
    fn serializes_self_describing_document() {
        let m = build_manifest(&[done("08", 2, vec![])], &config(), at());
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["dataset"], DATASET);
        assert_eq!(v["generated_at"], "2026-01-02T03:04:05Z");
        assert_eq!(v["vintage"]["acs_year"], 2023);
        assert_eq!(v["vintage"]["boundary_year"], 2024);
        assert_eq!(v["pmtiles"]["layer"], "places");
        assert_eq!(v["attrs"]["format"], ATTRS_FORMAT);
        assert_eq!(v["attrs"]["filename_template"], "places_attrs_{state}.json");
        assert_eq!(v["schema"]["join_key"]["name"], "GEOID");
        assert_eq!(v["schema"]["fields"][0]["var"], "DP03_0062E");
        assert_eq!(v["schema"]["fields"][0]["key"], "median_hh_income");
        assert_eq!(v["schema"]["fields"][0]["type"], "int");
    }

    #[test]
    fn write_overwrites_previous_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("manifest.json");
        let first = build_manifest(&[done("08", 2, vec![])], &config(), at());
        write_manifest(&first, &path).unwrap();
        let second = build_manifest(&[failed("08")], &config(), at());
        write_manifest(&second, &path).unwrap();

        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(v["totals"]["regions_failed"], 1);
        assert!(v["attrs"]["files"].as_array().unwrap().is_empty());
    }
}
