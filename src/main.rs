#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use agent_door::server;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "agent-door",
    about = "Multi-tenant agent-protocol gateway for third-party HTTP/JSON APIs"
)]
struct Cli {
    /// Optional config file; environment variables override its values.
    #[arg(short, long, default_value = "agent-door.toml")]
    config: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let worker_threads = server::runtime::worker_count();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("agent-door: failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    let exit_code = match rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
    })) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("agent-door: {:#}", e);
            1
        }
    };

    std::process::exit(exit_code);
}
