use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "smidr", version, about = "Build-orchestration daemon for Yocto/BitBake")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the build daemon.
    Daemon(DaemonArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct DaemonArgs {
    /// Address to bind the RPC surface to
    #[clap(long, default_value = "127.0.0.1:7621")]
    pub address: SocketAddr,
    /// Path to the `.sqlite` file used to store build state
    #[clap(long, default_value = "./smidr.sqlite")]
    pub db_path: PathBuf,
    /// Directory holding per-build workspaces, the layer cache and artifacts
    #[clap(long, default_value = "./smidr-state")]
    pub state_dir: PathBuf,
    /// Unix socket of the container engine
    #[clap(long, default_value = "/var/run/docker.sock")]
    pub docker_host: String,
    /// Maximum number of concurrently running builds; host CPU count when omitted
    #[clap(long)]
    pub max_concurrent_builds: Option<usize>,
    /// Per-build BitBake timeout in seconds
    #[clap(long, default_value_t = 24 * 3600)]
    pub build_timeout_secs: u64,
    /// Seconds a layer repository may stay unused before eviction
    #[clap(long, default_value_t = 14 * 24 * 3600)]
    pub layer_cache_ttl_secs: u64,
    /// Seconds an extracted artifact tree is retained
    #[clap(long, default_value_t = 30 * 24 * 3600)]
    pub artifact_ttl_secs: u64,
    /// Deadline for acquiring a per-repository cache lock, in seconds
    #[clap(long, default_value_t = 10)]
    pub layer_lock_timeout_secs: u64,
}
