use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use places_acs_builder::config::MAX_CONCURRENCY;
use places_acs_builder::{
    run, CensusClient, ConfigError, PipelineConfig, PipelineContext, Region, RegionCatalog,
};

#[derive(Parser)]
#[command(
    name = "places_acs_builder",
    about = "Build per-state ACS profile attribute files for US Census Places"
)]
struct Cli {
    /// Path to the JSON config document
    #[arg(short, long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every region, write attrs files and the manifest
    Build {
        /// Only these state codes (comma separated, e.g. 08,56)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        /// Census API key (default: $CENSUS_API_KEY)
        #[arg(long)]
        api_key: Option<String>,
        /// Regions fetched in parallel (overrides config)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
        /// Ask the API for its state list instead of the built-in catalog
        #[arg(long)]
        discover_regions: bool,
        /// Exit non-zero if any region failed
        #[arg(long)]
        strict: bool,
    },
    /// Validate the config and print the resolved schema
    Check,
    /// List the regions a build would process
    Regions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("invalid config {:?}", cli.config))?;

    let result = match cli.command {
        Commands::Check => {
            println!(
                "Vintage: ACS {} / boundaries {}",
                config.vintage.acs_year, config.vintage.boundary_year
            );
            println!("API:     {}", config.api.base_url);
            println!("Fields:");
            for v in config.schema.variables() {
                println!("  {:<14} -> {} ({:?})", v.external_code, v.output_key, v.kind);
            }
            println!("Regions: {}", config.catalog.len());
            println!("Config OK.");
            Ok(())
        }
        Commands::Regions => {
            let codes: Vec<&str> = config.catalog.iter().map(Region::code).collect();
            println!("{}", codes.join(" "));
            println!("\n{} regions", codes.len());
            Ok(())
        }
        Commands::Build {
            only,
            api_key,
            concurrency,
            discover_regions,
            strict,
        } => {
            let api_key = api_key.or_else(|| std::env::var("CENSUS_API_KEY").ok());
            let mut config = config.with_api_key(api_key);
            if config.api.api_key.is_none() {
                info!("No CENSUS_API_KEY set; requests may be rate limited more aggressively");
            }
            if let Some(n) = concurrency {
                if !(1..=MAX_CONCURRENCY).contains(&n) {
                    return Err(ConfigError::Invalid {
                        field: "concurrency",
                        message: format!("must be between 1 and {MAX_CONCURRENCY}, got {n}"),
                    }
                    .into());
                }
                config.concurrency = n;
            }

            let client = CensusClient::with_reqwest(config.api.clone())
                .context("failed to create HTTP client")?;

            let catalog = if discover_regions {
                let codes = client
                    .discover_regions()
                    .await
                    .context("failed to discover states from the API")?;
                RegionCatalog::new(codes)?
            } else {
                config.catalog.clone()
            };
            let catalog = catalog.filter(&only)?;

            let ctx = Arc::new(PipelineContext::new(config, client));
            let report = run(ctx, &catalog).await?;

            let totals = &report.manifest.totals;
            println!("\nDONE");
            println!("manifest:  {}", report.manifest_path.display());
            println!("attrs dir: {}", report.manifest.attrs.attrs_dir);
            println!(
                "states: {} ok, {} failed, {} partial | places written: {} (skipped {})",
                totals.regions_succeeded,
                totals.regions_failed,
                totals.regions_partial,
                totals.records_written,
                totals.rows_skipped
            );
            for f in &report.manifest.failures {
                println!("  FAILED state {} ({}): {}", f.statefp, f.stage, f.error);
            }

            if strict && totals.regions_failed > 0 {
                bail!("{} region(s) failed", totals.regions_failed);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
