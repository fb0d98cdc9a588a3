//! Measurement harness: repeated probe invocation with minimum-taking
//! and convergence detection.
//!
//! A probe call returns the elapsed TSC for `n_iter` loop iterations of
//! `UNROLL` instruction instances. The true cost is the minimum over
//! many calls; scheduler preemption, interrupts and frequency ramps
//! only ever add cycles. The loop stops once the minimum has not
//! improved significantly for a configured number of calls.

/// Operand rotation flavor: a serial dependency chain measures latency,
/// independent parallel chains measure reciprocal throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Serial,
    Parallel,
}

/// Whether memory operands are placed on their natural alignment or
/// biased by one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAlign {
    Aligned,
    Unaligned,
}

/// Instruction instances per loop iteration.
pub const UNROLL: u32 = 64;

/// Width of the independent chains in parallel mode.
pub const PARALLEL_WIDTH: usize = 6;

/// Run-wide knobs, from the command line.
#[derive(Debug, Clone, Copy)]
pub struct BenchConfig {
    pub estimate: bool,
    pub round: bool,
    pub dump: bool,
}

/// Per-probe measurement parameters.
#[derive(Debug, Clone, Copy)]
pub struct MeasureConfig {
    pub n_iter: u32,
    pub unroll: u32,
    /// Improvement (cycles per instruction) still considered progress.
    pub significant: f64,
    /// Calls without significant improvement before we accept the minimum.
    pub max_stable: u32,
    /// Hard cap on total calls; the current minimum is reported anyway.
    pub max_calls: u32,
}

impl BenchConfig {
    pub fn measure_config(&self, mnemonic: &str) -> MeasureConfig {
        // Serializing or entropy-gathering instructions run three
        // orders of magnitude slower than ALU ops; keep their call
        // runtime bounded with a low iteration count. Estimate mode
        // makes far fewer calls, so each one carries more iterations.
        let slow = matches!(mnemonic, "cpuid" | "rdrand" | "rdseed");
        let n_iter = match (slow, self.estimate) {
            (true, false) => 4,
            (true, true) => 40,
            (false, _) => 160,
        };
        MeasureConfig {
            n_iter,
            unroll: UNROLL,
            significant: if self.estimate { 0.25 } else { 0.04 },
            max_stable: if self.estimate { 1_000 } else { 50_000 },
            max_calls: 5_000_000,
        }
    }
}

/// Calls `probe` until the running minimum stabilizes and returns the
/// estimated cycles per instruction instance.
pub fn run_minimum(cfg: &MeasureConfig, probe: &mut dyn FnMut(u32) -> u64) -> f64 {
    let per_call = f64::from(cfg.n_iter) * f64::from(cfg.unroll);
    let significant_raw = cfg.significant * per_call;

    let mut best = probe(cfg.n_iter);
    let mut checkpoint = best;
    let mut stable = 0u32;

    for _ in 1..cfg.max_calls {
        let sample = probe(cfg.n_iter);
        if sample < best {
            best = sample;
        }
        if (checkpoint.saturating_sub(best)) as f64 >= significant_raw {
            checkpoint = best;
            stable = 0;
        } else {
            stable += 1;
            if stable >= cfg.max_stable {
                break;
            }
        }
    }

    best as f64 / per_call
}
