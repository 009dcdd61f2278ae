//! slicebay CLI - slice models and price prints from the terminal.
//!
//! Runs the built-in preview engine through the slicebay session controller.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use slicebay::{
    status_line, DeviceProfile, FailureClass, InfillPattern, Material, PrintMetrics,
    ProcessProfile, SliceRequest, SliceResult, Slicer, SlicerConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slicebay")]
#[command(about = "Slice 3D models and estimate print cost", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Slice a model and print its metrics
    Slice {
        #[command(flatten)]
        job: JobArgs,
        /// Write G-code to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Slice a model and print a price quote
    Quote {
        #[command(flatten)]
        job: JobArgs,
        /// Print the quote as JSON
        #[arg(long)]
        json: bool,
    },
    /// List built-in printer profiles
    Profiles,
}

#[derive(Args)]
struct JobArgs {
    /// STL or OBJ model
    model: PathBuf,
    /// Printer profile name (substring match)
    #[arg(short, long, default_value = "Generic")]
    printer: String,
    /// Filament: pla, petg, abs, asa, tpu, or a density in g/cm³
    #[arg(short, long, default_value = "pla")]
    material: Material,
    /// Layer height (mm)
    #[arg(long)]
    layer_height: Option<f64>,
    /// Sparse infill density (0.0 to 1.0)
    #[arg(long)]
    infill: Option<f64>,
    /// Infill pattern
    #[arg(long)]
    pattern: Option<InfillPattern>,
    /// Perimeter wall count
    #[arg(long)]
    shells: Option<u32>,
    /// Generate supports
    #[arg(long)]
    support: bool,
}

impl JobArgs {
    fn request(&self) -> Result<SliceRequest> {
        let device = DeviceProfile::find(&self.printer).with_context(|| {
            format!("unknown printer `{}`; see `slicebay profiles`", self.printer)
        })?;
        let model = std::fs::read(&self.model)
            .with_context(|| format!("reading {}", self.model.display()))?;

        let defaults = ProcessProfile::default();
        let process = ProcessProfile {
            slice_height: self.layer_height.unwrap_or(defaults.slice_height),
            slice_shell_count: self.shells.unwrap_or(defaults.slice_shell_count),
            slice_fill_sparse: self.infill.unwrap_or(defaults.slice_fill_sparse),
            slice_fill_type: self.pattern.unwrap_or(defaults.slice_fill_type),
            slice_support_enable: self.support,
            material: self.material,
        };
        Ok(SliceRequest::new(model, device, process))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => SlicerConfig::load(path)?,
        None => SlicerConfig::default(),
    };

    match cli.command {
        Commands::Slice { job, output } => {
            let result = run(&job, &config).await?;
            print_metrics(&result.metrics);
            if let Some(output) = output {
                std::fs::write(&output, &result.gcode)
                    .with_context(|| format!("writing {}", output.display()))?;
                println!("Wrote G-code to {}", output.display());
            }
        }
        Commands::Quote { job, json } => {
            let result = run(&job, &config).await?;
            let quote = config.pricing.quote(&result.metrics);
            if json {
                println!("{}", serde_json::to_string_pretty(&quote)?);
            } else {
                print_metrics(&result.metrics);
                println!(
                    "Material: {:.2} {}  Machine: {:.2} {}",
                    quote.material_cost, quote.currency, quote.machine_cost, quote.currency
                );
                println!("Total:    {:.2} {}", quote.total, quote.currency);
            }
        }
        Commands::Profiles => {
            for p in DeviceProfile::all_profiles() {
                println!(
                    "{:<24} {:>5.0} x {:>5.0} x {:>5.0} mm  nozzle {:.2} mm{}",
                    p.name,
                    p.max_x,
                    p.max_y,
                    p.max_z,
                    p.nozzle_size,
                    if p.origin_center { "  (center origin)" } else { "" }
                );
            }
        }
    }

    Ok(())
}

async fn run(job: &JobArgs, config: &SlicerConfig) -> Result<SliceResult> {
    let request = job.request()?;
    let slicer = Slicer::from_bundle(slicebay_preview::bundle, config.clone());

    let mut status = slicer.subscribe_status();
    let progress = tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            eprintln!("{}", status_line(&event));
        }
    });

    let outcome = slicer
        .slice_with_timeout(request, config.slice_timeout())
        .await;
    slicer.teardown().await;
    drop(slicer);
    progress.abort();

    outcome.map_err(|err| {
        let class = FailureClass::of(&err);
        tracing::debug!(?class, error = %err, "slice failed");
        anyhow::Error::new(err).context(class.message())
    })
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else {
        format!("{m}m {s:02}s")
    }
}

fn print_metrics(metrics: &PrintMetrics) {
    println!("Print time: {}", format_duration(metrics.time_seconds));
    println!(
        "Filament:   {:.1} g ({:.2} m)",
        metrics.material_grams,
        metrics.filament_mm / 1000.0
    );
    println!("Layers:     {}", metrics.layers);
}
