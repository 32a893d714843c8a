//! CLI for llcscope — build LLC eviction sets inside a guest and watch the
//! shared cache with them.

mod sysfs_topo;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};

use llcscope_core::monitor;
use llcscope_core::{
    BuildPlan, CoreContext, CoreParams, FileLcasSink, FilterMode, HelperThread, PinPolicy,
    build_l2_color_sets, build_single_llc_set, datafile,
};

#[derive(Parser)]
#[command(name = "llcscope")]
#[command(about = "LLC eviction sets and occupancy monitoring from inside a guest VM")]
#[command(version = llcscope_core::VERSION)]
struct Cli {
    /// Verbosity (repeat for more: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Debug diagnostics level (needs the gpa_hpa module for address checks)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Level {
    L2,
    #[value(alias = "l3")]
    Llc,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Graph {
    /// Eviction activity of one set over time
    Activity,
    /// Eviction rate vs wait time
    RateWait,
    /// Occupancy heatmap over (wait, evictions)
    Heatmap,
    /// Per-color occupancy series
    ColorOcc,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe cache geometry and calibrate per-level latencies
    Calibrate {
        /// Measurement repetitions per level
        #[arg(long, default_value = "350")]
        reps: u32,
    },

    /// Build eviction sets
    Build {
        /// Target cache level
        #[arg(long, value_enum, default_value = "llc")]
        level: Level,

        /// Worker threads (even, counting helpers; 0 = all cores)
        #[arg(short = 'c', long, default_value = "0")]
        threads: u32,

        /// Candidate pool scaling factor
        #[arg(short = 's', long)]
        cand_scale: Option<u32>,

        /// L2 colors to cover (0 = all)
        #[arg(short = 'u', long, default_value = "0")]
        colors: u32,

        /// Eviction sets per L2 color
        #[arg(short = 'f', long, default_value = "1")]
        evsets_per_l2: u32,

        /// Page offsets to cover (0 = all 64)
        #[arg(short = 'o', long, default_value = "1")]
        offsets: u32,

        /// Pre-assign (offset, color) cells instead of offset work-steal
        #[arg(long)]
        granular: bool,

        /// Topology-aware pinning via the vCPU topology prober
        #[arg(long)]
        vtop: bool,

        /// Sequential candidate filter (for parts where batching is noisy)
        #[arg(long)]
        sequential_filter: bool,

        /// Override the detected LLC slice count
        #[arg(long)]
        slices: Option<u32>,

        /// Overall runtime limit in minutes (0 = unlimited)
        #[arg(long, default_value = "10")]
        limit_min: u64,

        /// Write the build report as JSON to this path
        #[arg(long)]
        report: Option<String>,
    },

    /// Prime/probe monitoring over freshly built sets
    Monitor {
        /// What to measure and write under ./data/
        #[arg(short = 'G', long, value_enum, default_value = "heatmap")]
        graph: Graph,

        /// Multi-socket LCAS hotness tracking instead of a one-shot graph
        #[arg(long)]
        lcas: bool,

        /// Wait between prime and probe, microseconds
        #[arg(short = 'w', long, default_value = "7000")]
        wait_us: u64,

        /// Sweep/iteration bound: max wait (rate-wait, heatmap) or
        /// iteration count (color-occ)
        #[arg(short = 'M', long, default_value = "7000")]
        max_time: u64,

        /// Sweep step in microseconds, or scan period in ms for lcas
        #[arg(short = 't', long, default_value = "100")]
        time_step: u64,

        /// Suffix appended to data file names
        #[arg(short = 'a', long)]
        append: Option<String>,

        /// Worker threads (even; 0 = all cores)
        #[arg(short = 'c', long, default_value = "0")]
        threads: u32,

        /// L2 colors to cover (0 = all)
        #[arg(short = 'u', long, default_value = "0")]
        colors: u32,

        /// Eviction sets per L2 color
        #[arg(short = 'f', long, default_value = "1")]
        evsets_per_l2: u32,

        /// Page offsets to cover (0 = all 64)
        #[arg(short = 'o', long, default_value = "1")]
        offsets: u32,

        /// Topology-aware pinning (required for --lcas)
        #[arg(long)]
        vtop: bool,

        /// Disable adaptive wait-time shrinking
        #[arg(long)]
        fix_wait: bool,

        /// Measure prime/probe cost on a single set and exit
        #[arg(long)]
        perf: bool,

        /// EWMA alpha applied on rising hotness
        #[arg(long, default_value = "0.85")]
        alpha_rise: f64,

        /// EWMA alpha applied on falling hotness
        #[arg(long, default_value = "0.85")]
        alpha_fall: f64,

        /// Path of the published LCAS order map
        #[arg(long, default_value = "data/lcas_order")]
        lcas_map: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("llcscope: error: {e:#}");
        std::process::exit(1);
    }
}

fn params_for(
    threads: u32,
    cand_scale: Option<u32>,
    slices: Option<u32>,
    sequential: bool,
    limit_min: u64,
) -> anyhow::Result<CoreParams> {
    if threads % 2 != 0 {
        bail!(llcscope_core::ConfigError::OddThreadCount(threads));
    }
    Ok(CoreParams {
        num_threads: threads,
        cand_scale,
        slice_override: slices,
        filter_mode: if sequential {
            FilterMode::Sequential
        } else {
            FilterMode::Batch
        },
        runtime_limit_min: limit_min,
        ..CoreParams::default()
    })
}

fn probe_context(params: CoreParams) -> anyhow::Result<CoreContext> {
    let ctx = CoreContext::probe(params).context("platform probe failed")?;
    println!(
        "caches: L1d {}K/{}w | L2 {}K/{}w | L3 {}M/{}w x{} slices",
        ctx.hier.l1d.size / 1024,
        ctx.hier.l1d.ways,
        ctx.hier.l2.size / 1024,
        ctx.hier.l2.ways,
        ctx.hier.l3.size >> 20,
        ctx.hier.l3.ways,
        ctx.hier.l3.slices,
    );
    println!(
        "latencies: L1d {} | L2 {} | L3 {} | DRAM {} cycles",
        ctx.lats.l1d, ctx.lats.l2, ctx.lats.l3, ctx.lats.dram
    );
    println!(
        "thresholds: L1d {} | L2 {} | L3 {} | interrupt {}",
        ctx.lats.thr_l1d, ctx.lats.thr_l2, ctx.lats.thr_l3, ctx.lats.interrupt
    );
    Ok(ctx)
}

fn pin_policy(vtop: bool, interval_us: u64) -> PinPolicy {
    if vtop {
        PinPolicy::TopologyAware {
            probe: Box::new(sysfs_topo::SysfsTopologyProbe),
            interval_us,
        }
    } else {
        PinPolicy::RoundRobin
    }
}

/// Build the full table the monitoring modes run on.
fn build_table(
    ctx: &CoreContext,
    colors: u32,
    evsets_per_l2: u32,
    offsets: u32,
    vtop: bool,
) -> anyhow::Result<(
    llcscope_core::L2ColorSets,
    llcscope_core::SetTable,
    llcscope_core::BuildReport,
)> {
    let n_colors = if colors == 0 {
        ctx.hier.l2_colors()
    } else {
        colors
    };
    let l2sets = build_l2_color_sets(ctx, n_colors)?
        .context("could not build the L2 color sets")?;

    let plan = BuildPlan {
        n_offsets: offsets,
        n_colors,
        evsets_per_color: evsets_per_l2,
        granular: true,
    };
    let grid = llcscope_core::parallel::build_candidate_grid(ctx, &plan, &l2sets)?;
    let (table, report) = llcscope_core::build_llc_table(
        ctx,
        &plan,
        &l2sets,
        &grid,
        pin_policy(vtop, ctx.params.vtop_interval_us),
    )?;

    println!(
        "built {}/{} sets ({:.1}% coverage), minimal set size {}",
        report.total_built,
        report.total_possible,
        report.coverage * 100.0,
        report.min_evset_size
    );
    if report.total_built == 0 {
        bail!("no eviction sets were built");
    }
    Ok((l2sets, table, report))
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Calibrate { reps } => {
            let mut params = CoreParams::default();
            params.latency_reps = reps;
            probe_context(params)?;
            Ok(())
        }

        Commands::Build {
            level,
            threads,
            cand_scale,
            colors,
            evsets_per_l2,
            offsets,
            granular,
            vtop,
            sequential_filter,
            slices,
            limit_min,
            report,
        } => {
            let params =
                params_for(threads, cand_scale, slices, sequential_filter, limit_min)?;
            let ctx = probe_context(params)?;

            match level {
                Level::L2 => {
                    let n_colors = if colors == 0 {
                        ctx.hier.l2_colors()
                    } else {
                        colors
                    };
                    let sets = build_l2_color_sets(&ctx, n_colors)?
                        .context("could not build all requested L2 colors")?;
                    println!(
                        "built {} L2 colors x {} offsets",
                        sets.n_colors,
                        sets.n_offsets()
                    );
                    if cli.debug > 0 {
                        match llcscope_core::oracle::HpaOracle::open() {
                            Ok(mut oracle) => {
                                let check = llcscope_core::diag::l2_color_check(
                                    &sets,
                                    &mut oracle,
                                    &ctx.hier.l2,
                                );
                                println!(
                                    "host color check: {}",
                                    if check.distinct { "all distinct" } else { "DUPLICATES" }
                                );
                            }
                            Err(e) => log::warn!("debug oracle unavailable: {e}"),
                        }
                    }
                }
                Level::Llc => {
                    if colors == 1 && evsets_per_l2 <= 1 && offsets <= 1 && !granular {
                        // Single-pair path.
                        let helper = HelperThread::start()?;
                        match build_single_llc_set(&ctx, &helper)? {
                            Some((set, _l2)) => {
                                println!("built one LLC eviction set of {} lines", set.len())
                            }
                            None => bail!("single LLC build failed"),
                        }
                    } else {
                        let n_colors = if colors == 0 {
                            ctx.hier.l2_colors()
                        } else {
                            colors
                        };
                        let l2sets = build_l2_color_sets(&ctx, n_colors)?
                            .context("could not build the L2 color sets")?;
                        let plan = BuildPlan {
                            n_offsets: offsets,
                            n_colors,
                            evsets_per_color: evsets_per_l2,
                            granular,
                        };
                        let grid =
                            llcscope_core::parallel::build_candidate_grid(&ctx, &plan, &l2sets)?;
                        let (_table, rep) = llcscope_core::build_llc_table(
                            &ctx,
                            &plan,
                            &l2sets,
                            &grid,
                            pin_policy(vtop, ctx.params.vtop_interval_us),
                        )?;
                        println!(
                            "built {}/{} sets ({:.1}% coverage), minimal set size {}",
                            rep.total_built,
                            rep.total_possible,
                            rep.coverage * 100.0,
                            rep.min_evset_size
                        );
                        if let Some(path) = report {
                            std::fs::write(&path, serde_json::to_string_pretty(&rep)?)?;
                            println!("report written to {path}");
                        }
                    }
                }
            }
            Ok(())
        }

        Commands::Monitor {
            graph,
            lcas,
            wait_us,
            max_time,
            time_step,
            append,
            threads,
            colors,
            evsets_per_l2,
            offsets,
            vtop,
            fix_wait,
            perf,
            alpha_rise,
            alpha_fall,
            lcas_map,
        } => {
            let params = params_for(threads, None, None, false, 0)?;
            let ctx = probe_context(params)?;

            let stop = Arc::new(AtomicBool::new(false));
            {
                let stop = Arc::clone(&stop);
                ctrlc::set_handler(move || stop.store(true, Ordering::Release))
                    .context("failed to install the SIGINT handler")?;
            }

            // Prime/probe measurements need the quiet cgroup; abort if the
            // operator has not set it up.
            monitor::require_high_priority(true)?;

            if perf {
                let helper = HelperThread::start()?;
                let (set, l2) = build_single_llc_set(&ctx, &helper)?
                    .context("single LLC build failed")?;
                let ms = monitor::MonitorSet { set, lower: l2 };
                let report = monitor::perf_prime_probe(&ctx, &ms, &helper)?;
                println!(
                    "prime {:.1} us | probe {:.1} us (avg over {} rounds)",
                    report.prime_us_avg, report.probe_us_avg, report.iters
                );
                let sample = monitor::single_set_occupancy(&ctx, &ms, &helper, wait_us);
                println!(
                    "occupancy after {wait_us} us: {}/{} lines evicted ({} probe cycles)",
                    sample.evicted, sample.total, sample.probe_cycles
                );
                return Ok(());
            }

            if lcas {
                if !vtop {
                    bail!("--lcas requires --vtop");
                }
                let topo = sysfs_topo::probe_or_fail()?;
                let n_sockets = topo.n_sockets() as u32;
                // Every socket needs its own observer sets per color.
                let per_l2 = evsets_per_l2.max(2 * n_sockets);
                let offsets = if offsets <= 1 { 64 } else { offsets };
                let (l2sets, table, _report) =
                    build_table(&ctx, colors, per_l2, offsets, vtop)?;
                let per_socket = monitor::group_by_socket(&table, &l2sets, n_sockets);
                let sink = FileLcasSink::new(&lcas_map);
                println!("per-socket LLC hotness monitoring (Ctrl+C to stop)");
                monitor::lcas_monitor(
                    &ctx,
                    &per_socket,
                    &topo,
                    &sink,
                    &stop,
                    llcscope_core::LcasOptions {
                        wait_us,
                        period_ms: time_step.max(1),
                        alpha_rise,
                        alpha_fall,
                        fix_wait,
                    },
                )?;
                return Ok(());
            }

            let (l2sets, table, _report) =
                build_table(&ctx, colors, evsets_per_l2, offsets, vtop)?;
            let groups = monitor::group_by_color(&table, &l2sets);

            match graph {
                Graph::Activity => {
                    let ms = groups
                        .iter()
                        .flat_map(|g| g.sets.first())
                        .next()
                        .context("no set available for activity monitoring")?;
                    let helper = HelperThread::start()?;
                    let threshold = monitor::calibrate_group_threshold(
                        ms,
                        ms.set.target_ptr(),
                        &ctx.lats,
                        &helper,
                    );
                    if threshold <= 0 {
                        bail!("group-probe threshold calibration failed");
                    }
                    let diffs = monitor::activity_stream(
                        ms,
                        threshold as u64,
                        &ctx.lats,
                        &helper,
                        300,
                    );
                    if let Some(path) =
                        datafile::write_activity("data", &diffs, 100, 500, append.as_deref())?
                    {
                        println!("activity data written to {}", path.display());
                    }
                }
                Graph::RateWait => {
                    let sweep = monitor::rate_vs_wait(
                        &ctx,
                        &groups,
                        llcscope_core::HeatmapOptions {
                            time_step_us: time_step,
                            max_time_us: max_time,
                        },
                    )?;
                    let path = datafile::write_rate_sweep("data", &sweep, append.as_deref())?;
                    println!(
                        "rate-vs-wait data written to {} (prime time {} us)",
                        path.display(),
                        sweep.prime_time_us
                    );
                }
                Graph::Heatmap => {
                    let sets: Vec<monitor::MonitorSet> = groups
                        .iter()
                        .flat_map(|g| g.sets.iter().cloned())
                        .collect();
                    let data = monitor::occupancy_heatmap(
                        &ctx,
                        &sets,
                        llcscope_core::HeatmapOptions {
                            time_step_us: time_step,
                            max_time_us: max_time,
                        },
                    )?;
                    let path = datafile::write_heatmap("data", &data, append.as_deref(), None)?;
                    println!("heatmap data written to {}", path.display());
                }
                Graph::ColorOcc => {
                    let cycles_per_us = llcscope_core::timing::cycles_per_us_or_default();
                    let iterations = max_time.max(1);
                    let mut per_color: Vec<Vec<f64>> =
                        vec![Vec::with_capacity(iterations as usize); groups.len()];
                    let n_ways = groups
                        .iter()
                        .flat_map(|g| g.sets.first())
                        .map(|ms| ms.set.len())
                        .next()
                        .context("no sets to monitor")? as f64;

                    for _ in 0..iterations {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        let evictions =
                            monitor::parallel_round(&ctx, &groups, wait_us, cycles_per_us);
                        for (c, ev) in evictions.iter().enumerate() {
                            let lines = groups[c].sets.len() as f64 * n_ways;
                            per_color[c].push(if lines > 0.0 {
                                ev / lines * 100.0
                            } else {
                                0.0
                            });
                        }
                        std::thread::sleep(std::time::Duration::from_millis(time_step));
                    }

                    let path = datafile::write_color_occupancy(
                        "data",
                        &per_color,
                        wait_us,
                        append.as_deref(),
                    )?;
                    println!("per-color occupancy written to {}", path.display());
                }
            }
            Ok(())
        }
    }
}
