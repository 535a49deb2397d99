//! Command line entry point for validating and sampling a load test configuration.
#![warn(missing_debug_implementations)]

mod cli;
mod config;
mod observability;

fn main() -> anyhow::Result<()> {
    cli::execute()
}
