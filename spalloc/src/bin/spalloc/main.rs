// vim: tw=80
use std::{
    fs,
    path::PathBuf,
    sync::Arc,
};

use clap::{crate_version, Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use spalloc_core::{
    ClassKind,
    MemStore,
    Pool,
    PoolConfig,
    StrategyKind,
    Tunables,
    TunablesHandle,
    VdevConfig,
    types::*,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

si_scale::scale_fn!(bibytes0,
                    base: B1024,
                    constraint: UnitAndAbove,
                    mantissa_fmt: "{:.0}",
                    groupings: '_',
                    unit: "B");

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum Strategy {
    /// Dynamic fit
    Df,
    /// Cursor fit
    Cf,
    /// New dynamic fit
    Ndf,
}

impl From<Strategy> for StrategyKind {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::Df => StrategyKind::DynamicFit,
            Strategy::Cf => StrategyKind::CursorFit,
            Strategy::Ndf => StrategyKind::NewDynamicFit,
        }
    }
}

fn load_tunables(path: Option<&PathBuf>) -> Result<Tunables> {
    match path {
        Some(p) => {
            let s = fs::read_to_string(p)?;
            Tunables::from_yaml(&s)
        }
        None => Ok(Tunables::default())
    }
}

/// Print a one-line summary of every class that has any space
fn print_classes(pool: &Pool) {
    let mut table = tabular::Table::new("{:<} {:>} {:>} {:>} {:>} {:>}");
    table.add_row(tabular::Row::new()
        .with_cell("CLASS")
        .with_cell("SIZE")
        .with_cell("ALLOC")
        .with_cell("DEFERRED")
        .with_cell("FRAG")
        .with_cell("VDEVS"));
    for kind in [ClassKind::Normal, ClassKind::Special, ClassKind::Log] {
        let stats = pool.class_stats(kind);
        if stats.groups == 0 {
            continue;
        }
        let frag = stats.fragmentation
            .map(|f| format!("{f}%"))
            .unwrap_or_else(|| "-".to_owned());
        table.add_row(tabular::Row::new()
            .with_cell(kind)
            .with_cell(bibytes0(stats.space as f64))
            .with_cell(bibytes0(stats.alloc as f64))
            .with_cell(bibytes0(stats.deferred as f64))
            .with_cell(frag)
            .with_cell(format!("{}/{}", stats.alloc_groups, stats.groups)));
    }
    print!("{table}");
}

#[derive(Parser, Clone, Debug)]
/// Run a synthetic allocate/free/sync workload
struct Simulate {
    /// Number of devices
    #[clap(short = 'n', long, default_value_t = 2)]
    vdevs: usize,
    /// Size of each device in bytes
    #[clap(short = 's', long, default_value_t = 1 << 30)]
    vdev_size: u64,
    /// log2 of the metaslab size.  Chosen automatically by default.
    #[clap(long)]
    ms_shift: Option<u32>,
    /// Number of independent allocators
    #[clap(short = 'a', long, default_value_t = 1)]
    allocators: usize,
    /// Allocation strategy for the normal class
    #[clap(long, value_enum, default_value_t = Strategy::Df)]
    strategy: Strategy,
    /// Record changes in pool-wide log space maps
    #[clap(short = 'l', long)]
    log: bool,
    /// Number of txgs to run
    #[clap(short = 't', long, default_value_t = 32)]
    txgs: u64,
    /// Allocations per txg
    #[clap(long, default_value_t = 1000)]
    ops: u64,
    /// Percentage of live blocks to free in each txg
    #[clap(long, default_value_t = 10)]
    free_pct: u64,
    /// Copies of each block
    #[clap(long, default_value_t = 1)]
    copies: usize,
    /// Random seed
    #[clap(long, default_value_t = 0)]
    seed: u64,
    /// Tunables file, in YAML
    #[clap(long)]
    tunables: Option<PathBuf>,
    /// Keep the pool in this file, continuing any pool already there
    #[clap(long)]
    store: Option<PathBuf>,
    /// Print every metaslab at the end
    #[clap(short = 'v', long)]
    verbose: bool,
}

impl Simulate {
    fn open_or_create(&self, tunables: Arc<TunablesHandle>)
        -> Result<(Arc<MemStore>, Pool)>
    {
        if let Some(path) = self.store.as_ref().filter(|p| p.exists()) {
            let store = Arc::new(MemStore::open(path)?);
            let pool = Pool::open(store.clone(), tunables)?;
            info!(path = %path.display(), "continuing saved pool");
            return Ok((store, pool));
        }
        let store = Arc::new(MemStore::new());
        let mut vdev = VdevConfig::new(self.vdev_size);
        if let Some(shift) = self.ms_shift {
            vdev = vdev.ms_shift(shift);
        }
        let config = (0..self.vdevs).fold(
            PoolConfig::default()
                .allocators(self.allocators)
                .log_enabled(self.log)
                .strategy(ClassKind::Normal, self.strategy.into()),
            |config, _| config.vdev(vdev));
        let pool = Pool::create(store.clone(), config, tunables)?;
        Ok((store, pool))
    }

    fn main(self) -> Result<()> {
        let tunables = Arc::new(TunablesHandle::new(
            load_tunables(self.tunables.as_ref())?));
        let (store, pool) = self.open_or_create(tunables)?;
        let mut rng = XorShiftRng::seed_from_u64(self.seed);
        let mut live: Vec<BlockPtr> = Vec::new();
        let mut failures = 0u64;
        let mut txg = std::cmp::max(pool.synced_txg() + 1, TXG_INITIAL);
        let flags = AllocFlags::DONT_THROTTLE;
        for _ in 0..self.txgs {
            for i in 0..self.ops {
                let psize = 512u64 << rng.gen_range(0..9);
                let allocator = (i % pool.allocators() as u64) as usize;
                match pool.alloc(ClassKind::Normal, psize, self.copies, None,
                                 txg, flags, allocator)
                {
                    Ok(bp) => live.push(bp),
                    Err(Error::ENOSPC) => failures += 1,
                    Err(e) => return Err(e),
                }
            }
            let nfree = live.len() as u64 * self.free_pct / 100;
            for _ in 0..nfree {
                let idx = rng.gen_range(0..live.len());
                if live[idx].birth < txg {
                    let bp = live.swap_remove(idx);
                    pool.free(&bp, txg, false)?;
                }
            }
            pool.sync(txg)?;
            pool.sync_done(txg);
            txg += 1;
        }
        if failures > 0 {
            warn!(failures, "some allocations failed");
        }
        pool.export(txg)?;
        println!("{} blocks live after txg {}, {} allocations failed",
                 live.len(), txg, failures);
        print_classes(&pool);
        if self.verbose {
            print!("{pool}");
        }
        if let Some(path) = self.store.as_ref() {
            drop(pool);
            store.save(path)?;
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Print tunables as YAML, validating a file if one is given
struct ShowTunables {
    file: Option<PathBuf>,
}

impl ShowTunables {
    fn main(self) -> Result<()> {
        let t = load_tunables(self.file.as_ref())?;
        print!("{}", t.to_yaml()?);
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Describe a pool saved by a previous simulation
struct Status {
    store: PathBuf,
    /// Print every metaslab
    #[clap(short = 'v', long)]
    verbose: bool,
}

impl Status {
    fn main(self) -> Result<()> {
        let store = Arc::new(MemStore::open(&self.store)?);
        let pool = Pool::open(store, Arc::new(TunablesHandle::default()))?;
        println!("synced through txg {}", pool.synced_txg());
        print_classes(&pool);
        if self.verbose {
            print!("{pool}");
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Simulate(Simulate),
    Status(Status),
    Tunables(ShowTunables),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli: Cli = Cli::parse();
    match cli.cmd {
        SubCommand::Simulate(simulate) => simulate.main(),
        SubCommand::Status(status) => status.main(),
        SubCommand::Tunables(tunables) => tunables.main(),
    }
}
