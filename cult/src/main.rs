use clap::Parser;

use cult::cli::Opt;
use cult::driver::{InstBench, RunError};
use cult::harness::BenchConfig;
use cult::report;

fn main() {
    env_logger::init();
    let opt = Opt::parse();

    // Everything runs on one logical CPU; migrations would mix TSC
    // domains and boost states into the samples.
    if let Err(err) = cult_cpu::pin_to_cpu(0) {
        log::warn!("could not pin to CPU 0: {err}");
    }

    let cpu = cult_cpu::CpuInfo::detect();
    if !opt.quiet {
        eprintln!(
            "cult {} on {} ({})",
            env!("CARGO_PKG_VERSION"),
            cpu.brand_string,
            cpu.vendor
        );
    }

    let config = BenchConfig {
        estimate: opt.estimate,
        round: !opt.no_rounding,
        dump: opt.dump,
    };

    let mut bench = InstBench::new(&cpu, config, opt.quiet);
    let records = match bench.run(opt.instruction.as_deref()) {
        Ok(records) => records,
        Err(err @ RunError::UnknownInstruction(_)) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let result = match &opt.output {
        Some(path) => report::write_to_file(path, &cpu, &records),
        None => report::write_to_stdout(&cpu, &records),
    };
    if let Err(err) = result {
        eprintln!("could not write the report: {err}");
        std::process::exit(1);
    }
}
