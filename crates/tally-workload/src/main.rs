//! Workload driver for the counter and lock primitives.
//!
//! Runs concurrent simulated clients against an in-process store and then
//! verifies the invariants the primitives promise: counter value
//! conservation across decrements and rebalances, and strictly increasing
//! fencing tokens across lock handoffs.
//!
//! ```bash
//! tally-workload counter --start-value 10000 --shards 5 --workers 8
//! tally-workload lock --contenders 8 --rounds 40
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Result;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use tally_counter::CounterManager;
use tally_counter::DecrementService;
use tally_lock::LockService;
use tally_testing::InMemoryDocumentStore;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Workload driver for sharded counters and fenced locks.
#[derive(Parser)]
#[command(name = "tally-workload")]
#[command(version)]
#[command(about = "Exercise counters and locks with concurrent clients, then verify invariants")]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Enable debug-level logging.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Concurrent decrements racing splits and merges.
    Counter(CounterArgs),
    /// Contending owners passing a lock around.
    Lock(LockArgs),
}

#[derive(Args)]
struct CounterArgs {
    /// Starting counter value.
    #[arg(long, default_value_t = 10_000)]
    start_value: i64,

    /// Initial number of shards.
    #[arg(long, default_value_t = 5)]
    shards: u32,

    /// Number of concurrent decrementing clients.
    #[arg(long, default_value_t = 8)]
    workers: u32,

    /// Decrements each client performs.
    #[arg(long, default_value_t = 500)]
    decrements: u32,

    /// Splits the maintenance task attempts while clients run.
    #[arg(long, default_value_t = 2)]
    splits: u32,

    /// Merges the maintenance task attempts while clients run.
    #[arg(long, default_value_t = 2)]
    merges: u32,
}

#[derive(Args)]
struct LockArgs {
    /// Lock name contended over.
    #[arg(long, default_value = "workload")]
    lock_name: String,

    /// Number of contending owners.
    #[arg(long, default_value_t = 8)]
    contenders: u32,

    /// Total ownership handoffs to drive.
    #[arg(long, default_value_t = 40)]
    rounds: u32,

    /// Lease duration in seconds.
    #[arg(long, default_value_t = 30)]
    lease_secs: u64,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Counter(args) => run_counter_workload(args).await,
        Command::Lock(args) => run_lock_workload(args).await,
    }
}

/// Drive concurrent decrements while a maintenance task splits and merges,
/// then check that not one unit of value was created or destroyed.
async fn run_counter_workload(args: CounterArgs) -> Result<()> {
    let planned: i64 = i64::from(args.workers) * i64::from(args.decrements);
    if planned > args.start_value {
        bail!(
            "workload would overdraw the counter: {} decrements against a start value of {}",
            planned,
            args.start_value
        );
    }

    let store = InMemoryDocumentStore::new();
    let manager = CounterManager::new(store.clone());
    let counter = manager.create_counter("workload", args.start_value, args.shards).await?;
    manager.activate(&counter.id).await?;
    info!(counter_id = %counter.id, start_value = args.start_value, shards = args.shards, "counter ready");

    let started = Instant::now();
    let mut tasks = JoinSet::new();
    for worker in 0..args.workers {
        let store = store.clone();
        let counter_id = counter.id.clone();
        let quota = args.decrements;
        tasks.spawn(async move {
            let service = DecrementService::new(store);
            let mut landed = 0u32;
            let mut rejected = 0u64;
            while landed < quota {
                match service.decrement(&counter_id, 1).await {
                    Ok(true) => landed += 1,
                    Ok(false) => {
                        rejected += 1;
                        service.invalidate_cache(&counter_id);
                        tokio::task::yield_now().await;
                    }
                    Err(e) => return Err(e),
                }
            }
            info!(worker, landed, rejected, "worker finished");
            Ok(rejected)
        });
    }

    // Rebalance churn while the clients hammer the shards.
    let churn_manager = manager.clone();
    let churn_counter = counter.id.clone();
    let splits = args.splits;
    let merges = args.merges;
    let churn = tokio::spawn(async move {
        for _ in 0..splits {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = churn_manager.split(&churn_counter, 1).await;
        }
        for _ in 0..merges {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = churn_manager.merge(&churn_counter, 1).await;
        }
    });

    let mut total_rejected = 0u64;
    while let Some(res) = tasks.join_next().await {
        total_rejected += res??;
    }
    churn.await?;

    // A background consolidation may still be mid-fold, briefly hiding a
    // paused shard's value; wait for the store to quiesce before judging.
    let expected = args.start_value - planned;
    let mut remaining = manager.active_total(&counter.id).await?;
    for _ in 0..100 {
        if remaining == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        remaining = manager.active_total(&counter.id).await?;
    }
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        decremented = planned,
        remaining,
        rejected = total_rejected,
        "counter workload complete"
    );

    if remaining != expected {
        bail!("conservation violated: expected {expected} remaining, found {remaining}");
    }
    println!("counter OK: {planned} decrements applied, {remaining} remaining, {total_rejected} retries");
    Ok(())
}

/// Pass a lock between contenders through clean release handoffs, then
/// check the fencing tokens form the exact sequence 1..=handoffs.
///
/// Ownership rotates round-robin so consecutive winners always differ
/// and every win is exactly one guarded takeover: the creation mints
/// token 1 and each later handoff increments by one.
async fn run_lock_workload(args: LockArgs) -> Result<()> {
    if args.contenders < 2 {
        bail!("lock workload needs at least 2 contenders");
    }

    let store = InMemoryDocumentStore::new();
    let lease = Duration::from_secs(args.lease_secs.max(1));
    let tokens: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let turn = Arc::new(Mutex::new(0u32));

    let started = Instant::now();
    let mut tasks = JoinSet::new();
    for contender in 0..args.contenders {
        let service = LockService::new(store.clone());
        let lock_name = args.lock_name.clone();
        let tokens = Arc::clone(&tokens);
        let turn = Arc::clone(&turn);
        let rounds = args.rounds;
        let contenders = args.contenders;
        tasks.spawn(async move {
            let owner = format!("owner-{contender}");
            let mut wins = 0u32;
            loop {
                let my_turn = {
                    let t = turn.lock().unwrap();
                    if *t >= rounds {
                        break;
                    }
                    *t % contenders == contender
                };
                if !my_turn {
                    tokio::task::yield_now().await;
                    continue;
                }

                // Contend until this owner actually wins the handoff.
                loop {
                    let grant = service.acquire_lease(&lock_name, &owner, lease).await?;
                    if grant.is_held_by(&owner) {
                        let held = service.validate_lease(&lock_name, &owner, grant.fence_token).await?;
                        assert!(held, "fresh grant failed validation for {owner}");
                        tokens.lock().unwrap().push(grant.fence_token);
                        wins += 1;
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                service.release_lease(&owner).await?;
                *turn.lock().unwrap() += 1;
            }
            info!(%owner, wins, "contender finished");
            Ok::<_, tally_lock::LockError>(wins)
        });
    }

    let mut total_wins = 0u32;
    while let Some(res) = tasks.join_next().await {
        total_wins += res??;
    }

    let observed = tokens.lock().unwrap().clone();
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        handoffs = observed.len(),
        "lock workload complete"
    );

    if total_wins != args.rounds {
        bail!("expected {} handoffs, drove {}", args.rounds, total_wins);
    }
    let distinct: BTreeSet<i64> = observed.iter().copied().collect();
    let expected: BTreeSet<i64> = (1..=i64::from(args.rounds)).collect();
    if distinct != expected {
        bail!("fencing tokens not strictly increasing: observed {observed:?}");
    }
    println!("lock OK: {} handoffs, tokens 1..={} each minted exactly once", args.rounds, args.rounds);
    Ok(())
}
