use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::{DVec3, Vec3};
use tracing_subscriber::EnvFilter;
use worldspace_common::{Bounds, IntVector, Transform};
use worldspace_compose::{ActivationBudget, CompositionConfig, WorldComposition};
use worldspace_kernel::recording::{SceneCall, recording_services};
use worldspace_kernel::{Actor, Mobility, PackageContents};
use worldspace_stream::InMemoryLoader;
use worldspace_tiles::{Manifest, StreamingLayer, TileRecord, TileRegistry};

#[derive(Parser)]
#[command(name = "worldspace-cli", about = "CLI tool for worldspace composition")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Check a tile manifest and report every entry that would be skipped
    Validate {
        /// Manifest JSON file
        manifest: PathBuf,
    },
    /// Write a square grid manifest
    Grid {
        /// Output file
        out: PathBuf,
        /// Tiles per side
        #[arg(short, long, default_value = "8")]
        side: i64,
        /// Distance between tile origins
        #[arg(long, default_value = "10000")]
        spacing: i64,
    },
    /// Fly a viewer across a manifest and report what streamed
    Simulate {
        /// Manifest JSON file
        manifest: PathBuf,
        /// Composition config YAML
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of ticks to simulate
        #[arg(short, long, default_value = "120")]
        ticks: u64,
        /// Viewer speed along X, in units per tick
        #[arg(long, default_value = "500")]
        speed: f32,
        /// Activation steps per tick; overrides the config budget
        #[arg(long)]
        steps: Option<u32>,
    },
}

/// Synthetic package for a tile: a few actors spread over the tile bounds.
fn synthesize(name: &str, index: usize) -> PackageContents {
    let actors = (0..4 + index % 5)
        .map(|i| {
            let x = (i as f32) * 100.0;
            let mobility = if i % 3 == 0 {
                Mobility::Movable
            } else {
                Mobility::Static
            };
            Actor::new(Transform::from_position(Vec3::new(x, 0.0, 0.0)))
                .with_mobility(mobility)
                .with_net_relevance(i % 2 == 0)
                .with_components(1 + (i + index) % 40)
                .with_bounds(Bounds::new(Vec3::new(x - 50.0, -50.0, 0.0), Vec3::new(x + 50.0, 50.0, 100.0)))
        })
        .collect();
    tracing::trace!(package = %name, "synthesized package");
    PackageContents {
        actors,
        is_landscape: false,
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let manifest = Manifest::load(path).with_context(|| format!("reading {}", path.display()))?;
    let (registry, report) = TileRegistry::from_manifest(&manifest);
    println!("Manifest: {}", path.display());
    println!("  tiles accepted: {}", report.accepted);
    println!("  layers: {}", registry.layers().count());
    for error in &report.skipped {
        println!("  skipped: {error}");
    }
    for name in &report.orphaned {
        println!("  orphaned (placed at root): {name}");
    }
    if report.skipped.is_empty() && report.orphaned.is_empty() {
        println!("  OK");
    }
    Ok(())
}

fn grid(out: &Path, side: i64, spacing: i64) -> anyhow::Result<()> {
    let mut manifest = Manifest::new();
    manifest.push_layer(StreamingLayer::new("Grid", spacing * 2));
    manifest.push_layer(StreamingLayer::always_loaded("Persistent"));
    manifest.push_tile(TileRecord::new("/Game/Persistent_Sky", IntVector::ZERO).with_layer("Persistent"));
    for x in 0..side {
        for y in 0..side {
            manifest.push_tile(
                TileRecord::new(
                    format!("/Game/Tile_{x}_{y}"),
                    IntVector::new(x * spacing, y * spacing, 0),
                )
                .with_layer("Grid"),
            );
        }
    }
    manifest.save(out)?;
    println!("Wrote {} tiles to {}", side * side + 1, out.display());
    Ok(())
}

fn simulate(
    manifest: &Path,
    config: Option<&Path>,
    ticks: u64,
    speed: f32,
    steps: Option<u32>,
) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => CompositionConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => CompositionConfig::default(),
    };
    if let Some(steps) = steps {
        config.activation_budget = ActivationBudget::Steps { steps };
    }

    let manifest = Manifest::load(manifest)
        .with_context(|| format!("reading manifest {}", manifest.display()))?;
    let loader = InMemoryLoader::deferred();
    let (services, log) = recording_services(config.networked);
    let (mut world, report) =
        WorldComposition::from_manifest(config, &manifest, services, Box::new(loader.clone()));
    for (i, (_, tile)) in world.registry().iter().enumerate() {
        loader.insert(tile.package(), synthesize(tile.package(), i));
    }
    println!(
        "Simulating {ticks} ticks over {} tiles ({} skipped)",
        report.accepted,
        report.skipped.len()
    );

    let mut viewer = DVec3::ZERO;
    for tick in 0..ticks {
        let local = (viewer - world.origin().current().as_dvec3()).as_vec3();
        world.set_viewers(&[local]);
        loader.deliver_pending();
        let stats = world.tick(1.0 / 60.0);
        if stats.levels_shown + stats.levels_hidden + stats.levels_collected > 0 {
            println!(
                "tick {tick:>4}: shown={} hidden={} collected={} loads={} steps={} records={} origin={:?}",
                stats.levels_shown,
                stats.levels_hidden,
                stats.levels_collected,
                stats.loads_issued,
                stats.activation_steps,
                stats.total_records,
                world.origin().current(),
            );
        }
        viewer.x += f64::from(speed);
    }

    let rounds = world.flush_all_pending()?;
    let visible = world.table().records().filter(|r| r.is_visible()).count();
    let timer = world.timer();
    println!("Flushed in {rounds} rounds");
    println!("Visible levels: {visible}, records: {}", world.table().len());
    println!(
        "Scene calls: add={} remove={} offsets={}",
        log.count(|c| matches!(c, SceneCall::AddLevel(_))),
        log.count(|c| matches!(c, SceneCall::RemoveLevel(_))),
        log.count(|c| matches!(c, SceneCall::RenderOffset(_))),
    );
    println!(
        "Tick time: avg={:?} min={:?} max={:?} over {} ticks",
        timer.average(),
        timer.min(),
        timer.max(),
        timer.count()
    );
    println!("Unloaded on shutdown: {}", world.shutdown());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("worldspace-cli v{}", env!("CARGO_PKG_VERSION"));
            let config = CompositionConfig::default();
            println!("default activation budget: {:?}", config.activation_budget);
            println!("default dwell: {}s", config.decision.dwell_secs);
            println!("rebase: {:?}", config.rebase);
        }
        Commands::Validate { manifest } => validate(&manifest)?,
        Commands::Grid { out, side, spacing } => grid(&out, side, spacing)?,
        Commands::Simulate {
            manifest,
            config,
            ticks,
            speed,
            steps,
        } => simulate(&manifest, config.as_deref(), ticks, speed, steps)?,
    }

    Ok(())
}
