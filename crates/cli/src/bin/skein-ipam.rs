//! Address and port allocator run on the host that owns allocation state.
//!
//! Each invocation performs one operation and prints its result on stdout;
//! failures go to stderr with a non-zero exit code the remote caller maps
//! back to an error kind.

use clap::Parser;
use skein_cli::logging::{self, LogFormat};
use skein_common::{Database, Result};
use skein_provider::ipam::{protocol, SqliteAllocator};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "skein-ipam")]
#[command(version, about, after_help = protocol::USAGE)]
struct Cli {
    /// Allocation database
    #[arg(long, env = "SKEIN_IPAM_DB", default_value = "/var/lib/skein/ipam.db")]
    db: PathBuf,

    /// Operation and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

async fn run(cli: &Cli) -> Result<String> {
    let allocator = SqliteAllocator::new(Database::open(&cli.db)?)?;
    protocol::dispatch(&allocator, &cli.args).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(false, LogFormat::Text, "warn");

    match run(&cli).await {
        Ok(out) => println!("{}", out),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(protocol::exit_code(&e));
        }
    }
}
