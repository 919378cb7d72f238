use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use ftpfs::{ClientConfig, FtpFs, FuseHost};

#[derive(Parser)]
#[command(name = "ftpfs")]
#[command(version, about = "Mount a remote FTP directory as a local filesystem", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a remote FTP directory
    Mount {
        /// FTP server address (ip:port)
        #[arg(long)]
        addr: SocketAddr,

        /// Server-side directory to export (defaults to the login root)
        #[arg(long, default_value = "")]
        root: String,

        /// Local mount point
        mountpoint: String,

        /// Path to configuration file
        #[arg(long)]
        config_path: Option<String>,

        /// Per-operation timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Mount {
            addr,
            root,
            mountpoint,
            config_path,
            timeout,
        } => {
            let mut cfg = match config_path {
                Some(path) => ClientConfig::from_file(&path)?,
                None => ClientConfig::default(),
            };
            if let Some(secs) = timeout {
                cfg.op_timeout_secs = secs;
            }
            tracing::info!("connecting to {} (root {:?})", addr, root);
            let fs = FtpFs::new(addr, &root, cfg)?;
            let host = FuseHost::new(fs, mountpoint);
            host.run()?;
            Ok(())
        }
    }
}
