use std::{path::PathBuf, thread, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pass_dist_server::{
    config::{DistConfig, ENV_IPC_PATH, ENV_SPLIT, Role},
    pass_graph::GraphDesc,
    runtime::DistRuntime,
};

#[derive(Parser, Debug)]
#[command(
    name = "pass-dist-server",
    version,
    about = "Splits render-pass work between an authority and its followers"
)]
struct Cli {
    #[command(subcommand)]
    role: RoleCommand,
}

#[derive(Subcommand, Debug)]
enum RoleCommand {
    /// Rewrite the graph, send pass graphs to followers and merge their output.
    Authority(RunArgs),
    /// Build received pass graphs and return their output.
    Follower(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON pass-graph description; the built-in shadow pipeline when omitted.
    #[arg(long)]
    graph: Option<PathBuf>,

    /// JSON config file, applied before environment and flags.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frames to run, 0 runs until killed.
    #[arg(long, default_value_t = 0)]
    frames: u64,

    #[arg(long, env = ENV_SPLIT)]
    split: Option<u16>,

    #[arg(long, env = ENV_IPC_PATH)]
    ipc_path: Option<PathBuf>,

    /// Target frame interval in milliseconds.
    #[arg(long, default_value_t = 16)]
    frame_ms: u64,

    /// Print the pass tree as Graphviz DOT after the last frame.
    #[arg(long)]
    dot: bool,
}

impl RunArgs {
    fn config(&self) -> Result<DistConfig> {
        let mut cfg = DistConfig::load(self.config.as_deref())?;
        if let Some(split) = self.split {
            cfg.split_cnt = split;
        }
        if let Some(path) = &self.ipc_path {
            cfg.ipc_path = path.clone();
        }
        Ok(cfg)
    }

    fn graph(&self) -> Result<GraphDesc> {
        match &self.graph {
            Some(path) => GraphDesc::from_json_file(path),
            None => Ok(GraphDesc::shadow_pipeline()),
        }
    }
}

fn run(role: Role, args: &RunArgs) -> Result<()> {
    let cfg = args.config()?;
    log::info!("[main] {} config: {cfg:?}", role.label());

    let graph = args.graph()?;
    let mut runtime = DistRuntime::new(&cfg, role, &graph)?;
    runtime
        .connect(&cfg)
        .with_context(|| format!("failed to open {}", cfg.ipc_path.display()))?;

    let interval = Duration::from_millis(args.frame_ms);
    let mut frame = 0;
    while args.frames == 0 || frame < args.frames {
        let stats = runtime.run_frame()?;
        log::debug!("[main] {stats:?}");
        if stats.rewrites > 0 || stats.created.is_some() {
            log::info!("[main] frame {}: {stats:?}", stats.frame);
        }
        frame += 1;
        thread::sleep(interval);
    }

    if args.dot {
        println!("{}", runtime.graph_dot());
    }
    runtime.shutdown();
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    log::trace!("Starting with args: {cli:?}");
    match &cli.role {
        RoleCommand::Authority(args) => run(Role::Authority, args),
        RoleCommand::Follower(args) => run(Role::Follower, args),
    }
}
