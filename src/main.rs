//! scache CLI entrypoint

use clap::Parser;

use scopecache::cli::Cli;
use scopecache::output;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.execute() {
        output::error(&format!("Error: {:#}", e));
        std::process::exit(1);
    }
}
