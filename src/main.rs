use clap::Parser;
use cli::Arguments;

mod cli;
mod core;

fn main() {
    let args = Arguments::parse();

    if let Err(e) = cli::flops(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
