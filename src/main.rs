use crate::cli::run;

pub mod cli;
mod config;
pub mod domain;
pub mod http;
pub mod storage;
pub mod waveform;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
