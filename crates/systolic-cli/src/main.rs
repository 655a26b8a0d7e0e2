//! `systolic` — fault-injection campaigns on the PE-array dataflow model.
//!
//! ```text
//! USAGE:
//!   systolic stuck-at [--rows N --cols N --trials N --seed S]   Permanent-fault campaign
//!   systolic transient [--faults K ...]                         Transient-burst campaign
//!   systolic mem --rate R [--lambda-row L --lambda-col L]       Memory bitmap sampling
//! ```
//!
//! Campaigns run against a built-in weight-stationary reference dataflow:
//! ifmap streamed across the columns, weights resident per PE, ofmap drained
//! after two latency cycles, bias pinned to row 0, partial sums streamed up
//! the rows.

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use systolic_dataflow::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "systolic", about = "PE-array fault-injection campaigns", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Permanent stuck-at faults, one random fault per trial, replicated
    /// across the whole tile pass.
    StuckAt {
        /// PE rows.
        #[arg(long, default_value_t = 8)]
        rows: usize,
        /// PE columns.
        #[arg(long, default_value_t = 8)]
        cols: usize,
        /// Word length in bits.
        #[arg(long, default_value_t = 8)]
        bits: u16,
        /// Number of independent trials.
        #[arg(long, default_value_t = 100)]
        trials: usize,
        /// RNG seed.
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Propagate each fault across the PE interconnect first.
        #[arg(long)]
        propagate: bool,
    },
    /// Independent single-cycle transient faults.
    Transient {
        /// PE rows.
        #[arg(long, default_value_t = 8)]
        rows: usize,
        /// PE columns.
        #[arg(long, default_value_t = 8)]
        cols: usize,
        /// Word length in bits.
        #[arg(long, default_value_t = 8)]
        bits: u16,
        /// Faults per trial.
        #[arg(long, default_value_t = 16)]
        faults: usize,
        /// Number of independent trials.
        #[arg(long, default_value_t = 100)]
        trials: usize,
        /// RNG seed.
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Sample a memory-bitmap fault map.
    Mem {
        /// Memory rows.
        #[arg(long, default_value_t = 64)]
        rows: usize,
        /// Memory columns.
        #[arg(long, default_value_t = 32)]
        cols: usize,
        /// Fault rate (faults per cell).
        #[arg(long)]
        rate: f64,
        /// Poisson hot-spot row lambda (uniform sampling when omitted).
        #[arg(long)]
        lambda_row: Option<f64>,
        /// Poisson hot-spot column lambda.
        #[arg(long)]
        lambda_col: Option<f64>,
        /// RNG seed.
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Cmd::StuckAt {
            rows,
            cols,
            bits,
            trials,
            seed,
            propagate,
        } => cmd_campaign(rows, cols, bits, trials, seed, Injection::StuckAt { propagate }),
        Cmd::Transient {
            rows,
            cols,
            bits,
            faults,
            trials,
            seed,
        } => cmd_campaign(rows, cols, bits, trials, seed, Injection::Transient { faults }),
        Cmd::Mem {
            rows,
            cols,
            rate,
            lambda_row,
            lambda_col,
            seed,
        } => cmd_mem(rows, cols, rate, lambda_row, lambda_col, seed),
    }
}

enum Injection {
    StuckAt { propagate: bool },
    Transient { faults: usize },
}

/// The built-in weight-stationary reference dataflow.
fn reference_setup() -> Result<DataflowSetup> {
    let ifmap = DataflowPolicy::new()
        .with_permute(PermuteMap::new(vec![PeAxis::PeY, PeAxis::Clk], vec![2, 1, 0])?)
        .with_streaming(StreamMap::new(
            PeAxis::PeX,
            FlowDirection::Forward,
            FlowDirection::Forward,
        )?);
    let wght = DataflowPolicy::new()
        .with_permute(PermuteMap::new(vec![PeAxis::PeY, PeAxis::PeX], vec![2, 1, 0])?)
        .with_broadcast(BroadcastMap::new(vec![PeAxis::Clk])?);
    let ofmap = DataflowPolicy::new()
        .with_permute(PermuteMap::new(
            vec![PeAxis::PeY, PeAxis::PeX, PeAxis::Clk],
            vec![2, 1, 0],
        )?)
        .with_stall_latency(2);
    let bias = DataflowPolicy::new()
        .with_permute(PermuteMap::new(vec![PeAxis::PeX], vec![1, 0])?)
        .with_fixed(FixedMap::new(vec![PeAxis::PeY, PeAxis::Clk], vec![0, 0])?);
    let psum = DataflowPolicy::new()
        .with_permute(PermuteMap::new(vec![PeAxis::PeX, PeAxis::Clk], vec![2, 1, 0])?)
        .with_streaming(StreamMap::new(
            PeAxis::PeY,
            FlowDirection::Backward,
            FlowDirection::Backward,
        )?);
    Ok(DataflowSetup::new()
        .with_ifmap(ifmap)
        .with_wght(wght)
        .with_ofmap(ofmap)
        .with_bias(bias)
        .with_psum(psum))
}

fn reference_wiring() -> Result<MacWiring> {
    Ok(MacWiring {
        ifmap: PortWiring::new(WiringKind::IoPair, PeAxis::PeX, FlowDirection::Forward)?,
        wght: PortWiring::new(WiringKind::Internal, PeAxis::PeY, FlowDirection::Forward)?,
        psum: PortWiring::new(WiringKind::IoPair, PeAxis::PeY, FlowDirection::Backward)?,
    })
}

fn build_engine(rows: usize, cols: usize) -> Result<PeArray> {
    let ifmap = Tile::new(vec![rows, 3, 2]);
    let wght = Tile::new(vec![rows, cols, 2]).with_bias_shape(vec![cols, 2]);
    let ofmap = Tile::new(vec![rows, cols, 2]);
    let mut pe = PeArray::new(rows, cols).with_wiring(reference_wiring()?);
    pe.set_tiles(ifmap, wght, ofmap);
    pe.configure_dataflow(reference_setup()?);
    Ok(pe)
}

const ROLES: [TensorRole; 5] = [
    TensorRole::Ifmap,
    TensorRole::Weight,
    TensorRole::Ofmap,
    TensorRole::Bias,
    TensorRole::Psum,
];

fn cmd_campaign(
    rows: usize,
    cols: usize,
    bits: u16,
    trials: usize,
    seed: u64,
    injection: Injection,
) -> Result<()> {
    let mut pe = build_engine(rows, cols)?;

    // One shape-only forward pass; every trial restores the cached plan.
    for role in ROLES {
        pe.premap(role, true)?;
        pe.duplicate_mapping(role)?;
    }
    pe.align_slice_pack()?;
    let cache = pe.save_shapes()?;

    let n_clk = pe.n_clk().unwrap_or(0);
    println!("PE array   {rows}x{cols}, {n_clk} cycles per tile pass");
    println!("Trials     {trials}");
    println!();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut injected_total = 0usize;
    let mut hits = [0usize; 5];
    let mut touched = [0usize; 5];

    for _ in 0..trials {
        pe.restore_shapes(&cache)?;
        injected_total += match injection {
            Injection::StuckAt { propagate } => {
                pe.gen_stuck_at_faults(&mut rng, bits, FaultMode::BitFlip, None, propagate)?
            }
            Injection::Transient { faults } => {
                pe.gen_transient_faults(&mut rng, bits, faults, FaultMode::BitFlip, None)?
            }
        };
        pe.decompose_slice_pack()?;
        for (i, role) in ROLES.into_iter().enumerate() {
            pe.reduce_mapping(role)?;
            pe.demap(role)?;
            let count = match role {
                TensorRole::Ifmap => pe.ifmap_tile().map_or(0, |t| t.faults.len()),
                TensorRole::Weight => pe.wght_tile().map_or(0, |t| t.faults.len()),
                TensorRole::Ofmap => pe.ofmap_tile().map_or(0, |t| t.faults.len()),
                TensorRole::Bias => pe.wght_tile().map_or(0, |t| t.bias_faults.len()),
                TensorRole::Psum => pe.ofmap_tile().map_or(0, |t| t.psum_faults.len()),
            };
            hits[i] += count;
            if count > 0 {
                touched[i] += 1;
            }
        }
    }

    println!(
        "Injected   {injected_total} PE-space faults ({:.1} per trial)",
        injected_total as f64 / trials as f64
    );
    println!();
    println!("tensor   mean tile faults   trials touched");
    for (i, role) in ROLES.into_iter().enumerate() {
        println!(
            "{:<8} {:>16.2} {:>11} / {}",
            role.to_string(),
            hits[i] as f64 / trials as f64,
            touched[i],
            trials
        );
    }
    Ok(())
}

fn cmd_mem(
    rows: usize,
    cols: usize,
    rate: f64,
    lambda_row: Option<f64>,
    lambda_col: Option<f64>,
    seed: u64,
) -> Result<()> {
    use systolic_mem::{AddrDistribution, Bitmap};

    let distribution = match (lambda_row, lambda_col) {
        (Some(lambda_row), Some(lambda_col)) => AddrDistribution::Poisson {
            lambda_row,
            lambda_col,
        },
        (None, None) => AddrDistribution::Uniform,
        _ => anyhow::bail!("--lambda-row and --lambda-col must be given together"),
    };

    let bitmap = Bitmap::new(rows, cols, 8);
    let mut rng = StdRng::seed_from_u64(seed);
    let (faults, count) = bitmap.gen_fault_map(&mut rng, rate, distribution, "flip")?;

    println!("Memory     {rows}x{cols} cells");
    println!("Faults     {count} ({:.3}% of cells)", rate * 100.0);
    for (addr, mode) in faults.iter().take(10) {
        println!("  ({:>4}, {:>4})  {mode}", addr.0, addr.1);
    }
    if faults.len() > 10 {
        println!("  ... {} more", faults.len() - 10);
    }
    Ok(())
}
