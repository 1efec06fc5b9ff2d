use std::path::PathBuf;

use anyhow::ensure;
use clap::{Args, Parser, Subcommand};
use log::info;

use distwc::deploy::{self, Deployer, RateLimiter, COMMAND_WINDOW, MAX_COMMANDS_PER_WINDOW};
use distwc::master::{self, MasterConfig, WorkerSpec};
use distwc::worker::{self, WorkerConfig};
use distwc::{MASTER_RESULT_PORT, MASTER_STATUS_PORT, WORKER_SHUFFLE_PORT, WORKER_STATUS_PORT};

#[derive(Parser)]
#[command(name = "distwc", about = "Distributed word count over plain sockets")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Coordinate a run across a fixed set of workers.
    Master(MasterArgs),
    /// Run one worker process until it is told to terminate.
    Worker(WorkerArgs),
}

#[derive(Args)]
struct MasterArgs {
    /// Text corpus to count.
    #[arg(long)]
    input: PathBuf,
    /// Destination for the `word : count` lines.
    #[arg(long, default_value = "results.txt")]
    output: PathBuf,
    /// Candidate worker hostnames, one per line.
    #[arg(long)]
    hosts: PathBuf,
    /// Domain suffix appended to bare hostnames, e.g. `.enst.fr`.
    #[arg(long, default_value = "")]
    domain: String,
    /// Upper bound on workers taken from the hosts file.
    #[arg(long, default_value_t = 3)]
    max_workers: usize,
    /// Where the input shards are written before distribution.
    #[arg(long, default_value = "splits")]
    splits_dir: PathBuf,
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: String,
    /// Address workers report back to.
    #[arg(long)]
    advertised_ip: String,
    #[arg(long, default_value_t = MASTER_STATUS_PORT)]
    status_port: u16,
    #[arg(long, default_value_t = MASTER_RESULT_PORT)]
    result_port: u16,
    /// Copy shards and the worker binary to the hosts and launch them
    /// over ssh before starting the run.
    #[arg(long)]
    deploy: bool,
    /// Remote user for ssh/scp when deploying.
    #[arg(long, default_value = "")]
    user: String,
}

#[derive(Args)]
struct WorkerArgs {
    /// Identity used in status reports; the master's roster must carry the
    /// same string.
    #[arg(long)]
    id: String,
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: String,
    #[arg(long, default_value_t = WORKER_STATUS_PORT)]
    status_port: u16,
    #[arg(long, default_value_t = WORKER_SHUFFLE_PORT)]
    shuffle_port: u16,
    /// Directory containing this worker's shard files.
    #[arg(long, default_value = "splits")]
    splits_dir: PathBuf,
}

fn run_master(args: MasterArgs) -> anyhow::Result<()> {
    let mut limiter = RateLimiter::new(MAX_COMMANDS_PER_WINDOW, COMMAND_WINDOW);

    let hosts =
        deploy::load_reachable_hosts(&args.hosts, &args.domain, args.max_workers, &mut limiter)?;
    ensure!(
        !hosts.is_empty(),
        "no reachable worker in {}",
        args.hosts.display()
    );

    let shards = deploy::split_input(&args.input, &args.splits_dir, hosts.len())?;

    if args.deploy {
        ensure!(!args.user.is_empty(), "--deploy requires --user");
        let binary = std::env::current_exe()?;
        let mut deployer = Deployer {
            user: args.user.clone(),
            domain: args.domain.clone(),
            limiter,
        };
        for (i, host) in hosts.iter().enumerate() {
            if !deployer.clean_worker_dir(host) {
                continue;
            }
            if i < shards {
                deployer.send_shard(host, &args.splits_dir.join(format!("S{i}.txt")));
            }
            if deployer.send_binary(host, &binary) {
                deployer.launch_worker(host);
            }
        }
    }

    let workers = hosts
        .iter()
        .enumerate()
        .map(|(i, host)| WorkerSpec {
            id: host.clone(),
            command_addr: format!("{host}{}:{WORKER_STATUS_PORT}", args.domain),
            has_shard: i < shards,
        })
        .collect();

    let counts = master::run(MasterConfig {
        bind_ip: args.bind_ip,
        advertised_ip: args.advertised_ip,
        status_port: args.status_port,
        result_port: args.result_port,
        domain: args.domain,
        workers,
        output_path: args.output.clone(),
    })?;

    let total: u64 = counts.values().sum();
    info!(
        "counted {total} occurrences of {} distinct words into {}",
        counts.len(),
        args.output.display()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Cmd::Master(args) => run_master(args),
        Cmd::Worker(args) => worker::run(WorkerConfig {
            id: args.id,
            bind_ip: args.bind_ip,
            status_port: args.status_port,
            shuffle_port: args.shuffle_port,
            splits_dir: args.splits_dir,
        }),
    }
}
