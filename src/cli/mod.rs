use std::path::PathBuf;

use clap::Parser;

mod flops;

pub(crate) use flops::*;

#[derive(Debug, Parser)]
#[clap(name = "tflops", version, about)]
pub(crate) struct Arguments {
    /// Path to the TFLite model file.
    pub file_path: PathBuf,
}
