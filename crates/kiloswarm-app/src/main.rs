use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use kiloswarm_core::{
    JoinEvent, LocalizationMode, MetricsSink, Position, RasterShape, Swarm, SwarmConfig,
    TickSummary,
};
use serde_json::json;
use tracing::{debug, info};

/// Headless Kilobot-style self-assembly run: seed cross plus a staggered
/// start grid assembling into a centered rectangle.
#[derive(Debug, Parser)]
#[command(name = "kiloswarm", version, about)]
struct Cli {
    /// Ticks to simulate.
    #[arg(long, default_value_t = 10_000)]
    ticks: u64,

    /// RNG seed; omit for a fresh seed each run.
    #[arg(long)]
    seed: Option<u64>,

    /// Rows in the start grid.
    #[arg(long, default_value_t = 10)]
    grid_rows: u32,

    /// Columns in the start grid.
    #[arg(long, default_value_t = 20)]
    grid_cols: u32,

    /// Localization strategy.
    #[arg(long, value_enum, default_value_t = Localization::Trilateration)]
    localization: Localization,

    /// Disable movement noise and per-bot speed variance.
    #[arg(long)]
    no_movement_noise: bool,

    /// Disable distance measurement noise.
    #[arg(long)]
    no_distance_noise: bool,

    /// World width and height in world units.
    #[arg(long, default_value_t = 1600)]
    world_size: u32,

    /// Side length of the centered square target shape.
    #[arg(long, default_value_t = 200)]
    shape_size: u32,

    /// Ticks between metrics log lines (0 disables them).
    #[arg(long, default_value_t = 100)]
    metrics_interval: u32,

    /// Stop as soon as every bot has joined the shape.
    #[arg(long)]
    stop_when_assembled: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Localization {
    Trilateration,
    Perfect,
}

impl From<Localization> for LocalizationMode {
    fn from(mode: Localization) -> Self {
        match mode {
            Localization::Trilateration => Self::Trilateration,
            Localization::Perfect => Self::Perfect,
        }
    }
}

/// Streams tick summaries and join events into the log.
struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn on_tick(&mut self, summary: &TickSummary) {
        info!(
            tick = summary.tick.0,
            elapsed = format_args!("{:.1}s", summary.elapsed),
            joined = summary.joined,
            bots = summary.bot_count,
            avg_location_error = summary.average_location_error,
            "progress"
        );
        for JoinEvent {
            bot,
            location_error,
            elapsed,
        } in &summary.join_events
        {
            debug!(
                bot = bot.0,
                location_error,
                elapsed = format_args!("{elapsed:.1}s"),
                "joined shape"
            );
        }
    }
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    if cli.shape_size >= cli.world_size {
        bail!("shape must fit inside the world");
    }

    let config = SwarmConfig {
        grid_rows: cli.grid_rows,
        grid_cols: cli.grid_cols,
        localization: cli.localization.into(),
        movement_noise: !cli.no_movement_noise,
        distance_noise: !cli.no_distance_noise,
        rng_seed: cli.seed,
        metrics_interval: cli.metrics_interval,
        ..SwarmConfig::default()
    };

    let center = f64::from(cli.world_size) / 2.0;
    let half = cli.shape_size / 2;
    let lo = cli.world_size / 2 - half;
    let hi = cli.world_size / 2 + half;
    let shape = RasterShape::from_fn(cli.world_size, cli.world_size, |x, y| {
        (lo..hi).contains(&x) && (lo..hi).contains(&y)
    })
    .context("building target shape")?;

    let mut swarm =
        Swarm::with_metrics(config, Box::new(LogMetrics)).context("constructing swarm")?;
    swarm.populate(Position::new(center, center));
    info!(
        bots = swarm.bot_count(),
        ticks = cli.ticks,
        world = cli.world_size,
        shape = cli.shape_size,
        "starting assembly run"
    );

    let mut ticks_run = 0;
    for _ in 0..cli.ticks {
        swarm.step(&shape);
        ticks_run += 1;
        if cli.stop_when_assembled && swarm.joined_count() == swarm.bot_count() {
            info!(tick = swarm.tick().0, "assembly complete");
            break;
        }
    }

    let summary = json!({
        "ticks": ticks_run,
        "elapsed_seconds": swarm.elapsed(),
        "bots": swarm.bot_count(),
        "joined": swarm.joined_count(),
        "average_location_error": swarm.average_location_error(),
        "activations_issued": swarm.registry().issued(),
    });
    println!("{summary}");
    Ok(())
}
