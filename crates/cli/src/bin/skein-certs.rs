//! Certificate issuer driven by environment variables.
//!
//! Prints the issued PEM bundle on stdout.

use clap::Parser;
use skein_provider::certs::protocol;

#[derive(Parser)]
#[command(name = "skein-certs")]
#[command(version, about = "Issue a mesh CA or host key or certificate from MANAGER_* variables")]
struct Cli {}

fn main() {
    let _ = Cli::parse();

    match protocol::handle(&|name| std::env::var(name).ok()) {
        Ok(pem) => print!("{}", pem),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
