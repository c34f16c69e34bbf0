use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::{rngs::StdRng, SeedableRng};
use tombola_client::{FeltApi, FeltClient, PollOptions, DEFAULT_BASE_URL};
use tombola_core::{FeatureCollection, SourceLayer};
use tombola_pipeline::{Pipeline, PipelineConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tombola", version, about = "Sample a Felt layer and publish the draw as a new map")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Felt API token
    #[arg(long, env = "FELT_API_TOKEN", hide_env_values = true, global = true, default_value = "")]
    token: String,

    /// Felt API base URL
    #[arg(long = "base-url", env = "FELT_API_BASE", global = true, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Source map id
    #[arg(long = "map", env = "TOMBOLA_SOURCE_MAP", global = true)]
    map: Option<String>,

    /// Source layer id
    #[arg(long = "layer", env = "TOMBOLA_SOURCE_LAYER", global = true)]
    layer: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export, sample and publish the draw as a new map
    Run {
        /// Percentage of features to select (1-100)
        #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u8).range(1..=100))]
        percentage: u8,
    },
    /// Export the source layer
    Export {
        /// Write the collection to this file instead of summarising it
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Export and sample the source layer into a local GeoJSON file
    Sample {
        #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u8).range(1..=100))]
        percentage: u8,
        #[arg(long)]
        out: PathBuf,
        /// Seed for a reproducible draw
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Publish a local GeoJSON FeatureCollection as a new map
    Publish {
        file: PathBuf,
        /// Map title (default: file name and timestamp)
        #[arg(long)]
        title: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("TOMBOLA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TOMBOLA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TOMBOLA_METRICS_ADDR; expected host:port");
        }
    }
}

impl Cli {
    fn client(&self) -> Result<FeltClient> {
        FeltClient::with_base_url(self.token.clone(), self.base_url.clone()).context("building Felt client (set FELT_API_TOKEN or --token)")
    }

    fn source(&self) -> Result<SourceLayer> {
        let map = self.map.clone().ok_or_else(|| anyhow!("source map id required (--map or TOMBOLA_SOURCE_MAP)"))?;
        let layer = self.layer.clone().ok_or_else(|| anyhow!("source layer id required (--layer or TOMBOLA_SOURCE_LAYER)"))?;
        Ok(SourceLayer::new(map, layer))
    }
}

fn write_collection(path: &Path, fc: &FeatureCollection) -> Result<()> {
    let text = serde_json::to_string(fc)?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

fn read_collection(path: &Path) -> Result<FeatureCollection> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {} as a FeatureCollection", path.display()))
}

async fn run_pipeline(cli: &Cli, percentage: u8) -> Result<()> {
    let api: Arc<dyn FeltApi> = Arc::new(cli.client()?);
    let config = PipelineConfig { source: cli.source()?, poll: PollOptions::from_env() };
    // Headless: no live map is embedded, so the highlight step is skipped.
    let pipeline = Pipeline::new(api, config);

    let mut rx = pipeline.transitions();
    let human = cli.output == Output::Human;
    let printer = tokio::spawn(async move {
        while let Ok(status) = rx.recv().await {
            if human && status.is_busy() {
                eprintln!("{}", status.describe());
            }
        }
    });

    let res = pipeline.run(percentage as f64).await;
    drop(pipeline);
    let _ = printer.await;

    let outcome = res?;
    match cli.output {
        Output::Human => {
            println!("Selected {} of {} features", outcome.selected, outcome.total);
            println!("New map: {}", outcome.published.map_url);
        }
        Output::Json => {
            let v = serde_json::json!({
                "map_url": outcome.published.map_url,
                "map_id": outcome.published.map_id,
                "layer_id": outcome.published.layer_id,
                "selected": outcome.selected,
                "total": outcome.total,
            });
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { percentage } => {
            info!(percentage, "run invoked");
            if let Err(e) = run_pipeline(&cli, *percentage).await {
                error!(error = ?e, "run failed");
                return Err(e);
            }
        }
        Commands::Export { out } => {
            let client = cli.client()?;
            let source = cli.source()?;
            info!(source = %source, "export invoked");
            let fc = tombola_export::export_layer(&client, &source, PollOptions::from_env()).await?;
            match (out, cli.output) {
                (Some(path), _) => {
                    write_collection(path, &fc)?;
                    println!("wrote {} features to {}", fc.len(), path.display());
                }
                (None, Output::Json) => println!("{}", serde_json::to_string(&fc)?),
                (None, Output::Human) => println!("{} features in {}", fc.len(), source),
            }
        }
        Commands::Sample { percentage, out, seed } => {
            let client = cli.client()?;
            let source = cli.source()?;
            info!(source = %source, percentage, seed = ?seed, "sample invoked");
            let fc = tombola_export::export_layer(&client, &source, PollOptions::from_env()).await?;
            let selected = match seed {
                Some(s) => tombola_core::sample_with(&fc, *percentage as f64, &mut StdRng::seed_from_u64(*s))?,
                None => tombola_core::sample(&fc, *percentage as f64)?,
            };
            write_collection(out, &selected)?;
            println!("Selected {} of {} features into {}", selected.len(), fc.len(), out.display());
        }
        Commands::Publish { file, title } => {
            let client = cli.client()?;
            let fc = read_collection(file)?;
            let title = title.clone().unwrap_or_else(|| {
                let stem = file.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "selection".into());
                format!("{} - {}", stem, chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
            });
            info!(file = %file.display(), features = fc.len(), "publish invoked");
            let published = tombola_publish::publish(&client, &fc, &title, PollOptions::from_env()).await?;
            match cli.output {
                Output::Human => println!("New map: {}", published.map_url),
                Output::Json => println!("{}", serde_json::to_string_pretty(&published)?),
            }
        }
    }
    Ok(())
}
