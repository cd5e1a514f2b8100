//! ccache image cache server binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use ccache::config::Config;
use ccache::server::Server;
use ccache::{logging, signal};
use clap::Parser;

#[derive(Parser)]
#[command(name = "ccache")]
#[command(about = "Caching HTTP server for static files and resized images")]
struct Args {
    /// Path to configuration file (optional, flags override it)
    config: Option<PathBuf>,

    /// Port to listen on, keeping the configured address
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory static files and zoom sources are read from
    #[arg(short, long)]
    src: Option<PathBuf>,

    /// Scratch directory for generated images
    #[arg(short, long)]
    tmp: Option<PathBuf>,

    /// Number of network worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Number of background I/O threads
    #[arg(short, long)]
    bio_threads: Option<usize>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.listen = SocketAddr::new(config.server.listen.ip(), port);
        }
        if let Some(src) = &self.src {
            config.storage.source_dir = src.clone();
        }
        if let Some(tmp) = &self.tmp {
            config.storage.tmp_dir = tmp.clone();
        }
        if let Some(workers) = self.workers {
            config.server.workers = workers;
        }
        if let Some(threads) = self.bio_threads {
            config.bio.threads = threads;
        }
    }
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    args.apply(&mut config);

    if args.print_config {
        match toml::to_string(&config) {
            Ok(s) => print!("{s}"),
            Err(e) => {
                eprintln!("Failed to render config: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if let Err(e) = run(&config) {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> ccache::Result<()> {
    let shutdown = signal::install_signal_handler()?;
    let server = Server::bind(config)?;
    server.run(shutdown)
}
