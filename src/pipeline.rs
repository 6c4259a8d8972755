use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::census::{CensusClient, FetchedTable};
use crate::config::PipelineConfig;
use crate::error::{RegionError, RowError, WriteError};
use crate::manifest::{build_manifest, write_manifest, Manifest};
use crate::normalize::{normalize_row, AttributeRecord};
use crate::regions::{Region, RegionCatalog};
use crate::schema::SchemaMapping;
use crate::writer::RegionWriter;

/// Everything a region needs, shared read-only across workers.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub client: CensusClient,
    pub writer: RegionWriter,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig, client: CensusClient) -> Self {
        let writer = RegionWriter::new(&config.outputs, &config.vintage);
        PipelineContext {
            config,
            client,
            writer,
        }
    }
}

#[derive(Debug)]
pub struct RegionSummary {
    pub file: PathBuf,
    pub records: usize,
    pub rows_received: usize,
    pub skipped: Vec<RowError>,
}

#[derive(Debug)]
pub enum RegionOutcome {
    Done(RegionSummary),
    Failed(RegionError),
}

#[derive(Debug)]
pub struct RegionResult {
    pub region: Region,
    pub outcome: RegionOutcome,
}

impl RegionResult {
    fn failed(region: &Region, error: RegionError) -> Self {
        RegionResult {
            region: region.clone(),
            outcome: RegionOutcome::Failed(error),
        }
    }

    /// Records written; zero for a failed region.
    pub fn record_count(&self) -> usize {
        match &self.outcome {
            RegionOutcome::Done(s) => s.records,
            RegionOutcome::Failed(_) => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, RegionOutcome::Failed(_))
    }
}

pub struct RunReport {
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    pub results: Vec<RegionResult>,
}

/// Fetch → normalize → write for one region. Never panics on bad data and
/// never touches another region's state.
pub async fn process_region(region: &Region, ctx: &PipelineContext) -> RegionResult {
    let t0 = Instant::now();

    let table = match ctx.client.fetch(region, &ctx.config.schema).await {
        Ok(t) => t,
        Err(e) => {
            warn!("state {}: fetch failed: {}", region, e);
            return RegionResult::failed(region, e.into());
        }
    };

    let rows_received = table.rows_received();
    let (records, skipped) = normalize_table(&table, &ctx.config.schema, region);

    let file = match ctx.writer.write(region, &records) {
        Ok(p) => p,
        Err(e) => {
            warn!("state {}: {}", region, e);
            return RegionResult::failed(region, e.into());
        }
    };

    info!(
        "state {}: rows={} written={} skipped={} ({:.1}s)",
        region,
        rows_received,
        records.len(),
        skipped.len(),
        t0.elapsed().as_secs_f64()
    );

    RegionResult {
        region: region.clone(),
        outcome: RegionOutcome::Done(RegionSummary {
            file,
            records: records.len(),
            rows_received,
            skipped,
        }),
    }
}

/// Normalize every data row. Bad rows are collected, not fatal; the first
/// occurrence of a join key wins.
pub fn normalize_table(
    table: &FetchedTable,
    schema: &SchemaMapping,
    region: &Region,
) -> (Vec<AttributeRecord>, Vec<RowError>) {
    let columns = table.column_index();
    let mut skipped = table.malformed_rows.clone();
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(table.rows.len());

    for row in &table.rows {
        match normalize_row(row, &columns, schema, region) {
            Ok(rec) => {
                if seen.insert(rec.join_key.clone()) {
                    records.push(rec);
                } else {
                    skipped.push(RowError::DuplicateKey(rec.join_key));
                }
            }
            Err(e) => {
                debug!("state {}: skipping row: {}", region, e);
                skipped.push(e);
            }
        }
    }

    (records, skipped)
}

/// Process every region in `catalog`, then write the manifest.
///
/// Region failures end up in the manifest. The only error returned is a
/// failure to prepare the output root or to write the manifest itself.
pub async fn run(ctx: Arc<PipelineContext>, catalog: &RegionCatalog) -> Result<RunReport, WriteError> {
    if let Some(dist) = &ctx.config.outputs.dist_dir {
        fs::create_dir_all(dist).map_err(|source| WriteError {
            path: dist.clone(),
            source,
        })?;
    }

    let concurrency = ctx.config.concurrency.max(1);
    info!(
        "Processing {} regions (concurrency {})",
        catalog.len(),
        concurrency
    );

    let pb = ProgressBar::new(catalog.len() as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=> "));
    }

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut handles = Vec::with_capacity(catalog.len());

    for region in catalog.iter().cloned() {
        // Permits are taken here, in catalog order, so concurrency 1 is strictly sequential.
        let permit = Arc::clone(&semaphore).acquire_owned().await.ok();
        let ctx = Arc::clone(&ctx);
        let pb = pb.clone();
        let task_region = region.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            pb.set_message(format!("state {}", task_region));
            let result = process_region(&task_region, &ctx).await;
            pb.inc(1);
            result
        });
        handles.push((region, handle));
    }

    // Barrier: the manifest waits for every region.
    let mut results = Vec::with_capacity(handles.len());
    for (region, handle) in handles {
        let result = match handle.await {
            Ok(r) => r,
            Err(e) => {
                warn!("state {}: worker aborted: {}", region, e);
                RegionResult::failed(&region, RegionError::Aborted(e.to_string()))
            }
        };
        results.push(result);
    }
    pb.finish_and_clear();

    let manifest = build_manifest(&results, &ctx.config, chrono::Utc::now());
    let manifest_path = ctx.config.outputs.manifest.clone();
    write_manifest(&manifest, &manifest_path)?;

    info!(
        "Done: {} regions ok, {} failed, {} records",
        manifest.totals.regions_succeeded, manifest.totals.regions_failed, manifest.totals.records_written
    );

    Ok(RunReport {
        manifest,
        manifest_path,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::parse_table;
    use crate::schema::FieldSpec;

    fn schema() -> SchemaMapping {
        SchemaMapping::from_fields(&[FieldSpec {
            var: Some("DP03_0062E".into()),
            key: Some("median_hh_income".into()),
            kind: Some("int".into()),
            unit: None,
        }])
        .unwrap()
    }

    #[test]
    fn bad_rows_do_not_drop_good_ones() {
        let table = parse_table(
            r#"[["DP03_0062E","state","place"],
                ["75000","08","46465"],
                ["1","08",""],
                ["2","08"],
                ["81000","08","27425"],
                ["99","08","46465"]]"#,
        )
        .unwrap();
        let region = Region::parse("08").unwrap();
        let (records, skipped) = normalize_table(&table, &schema(), &region);

        let keys: Vec<&str> = records.iter().map(|r| r.join_key.as_str()).collect();
        assert_eq!(keys, vec!["0846465", "0827425"]);
        assert_eq!(records[0].values["median_hh_income"], serde_json::json!(75000));

        let kinds: Vec<&str> = skipped.iter().map(RowError::kind).collect();
        assert_eq!(kinds, vec!["column_count", "missing_key", "duplicate_key"]);
    }
}
