use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "cult",
    version,
    about = "\
Measures the latency and reciprocal throughput of x86 instructions on
the host CPU and prints one JSON report.

Run it on an idle machine; the measurement loop takes minimum timings
but cannot fully hide a busy scheduler."
)]
pub struct Opt {
    /// No progress output, only the final JSON.
    #[arg(long)]
    pub quiet: bool,

    /// Faster, less precise measurement loop.
    #[arg(long)]
    pub estimate: bool,

    /// Report raw cycle estimates instead of canonical fractions.
    #[arg(long)]
    pub no_rounding: bool,

    /// Disassemble each generated probe to stderr.
    #[arg(long)]
    pub dump: bool,

    /// Only measure a single instruction (by mnemonic).
    #[arg(long, value_name = "NAME")]
    pub instruction: Option<String>,

    /// Write the JSON report to a file instead of stdout.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}
