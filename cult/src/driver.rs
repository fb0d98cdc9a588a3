//! Driver: walks the instruction database, classifies each mnemonic,
//! and turns every feasible operand shape into one report record.
//!
//! Flow per shape: materialize operands for the serial and parallel
//! rotations, assemble the probe and its overhead twin, measure all
//! four, subtract, combine, round. Probe functions never escape
//! `test_instruction`; the JIT mappings are dropped before the next
//! shape is touched.

use iced_x86::{Code, CpuidFeature, Decoder, DecoderOptions, Formatter, IntelFormatter};
use rustc_hash::FxHashSet;

use cult_cpu::CpuInfo;

use crate::arena::Arena;
use crate::db::{self, InstDb, MnemonicGroup};
use crate::harness::{
    run_minimum, BenchConfig, ChainMode, MemAlign, PARALLEL_WIDTH, UNROLL,
};
use crate::inst_spec::{InstSpec, OperandKind, SpecFlags};
use crate::materialize::materialize;
use crate::probe::{assemble_probe, ProbeRequest};
use crate::regs::Arch;
use crate::report::InstRecord;
use crate::rounding::round_cycles;
use crate::sig_iter::{OpFlags, SigIter};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("instruction '{0}' was not found in the database")]
    UnknownInstruction(String),
}

/// Mnemonics measured as bare zero-operand probes.
const ZERO_OPERAND: &[&str] = &[
    "cpuid",
    "emms",
    "lfence",
    "mfence",
    "sfence",
    "rdtsc",
    "rdtscp",
    "vzeroall",
    "vzeroupper",
    "xgetbv",
];

pub struct InstBench<'a> {
    cpu: &'a CpuInfo,
    db: InstDb,
    config: BenchConfig,
    arch: Arch,
    arena: Option<Arena>,
    quiet: bool,
}

impl<'a> InstBench<'a> {
    pub fn new(cpu: &'a CpuInfo, config: BenchConfig, quiet: bool) -> InstBench<'a> {
        let arch = Arch::host();
        InstBench {
            cpu,
            db: InstDb::new(arch),
            config,
            arch,
            arena: None,
            quiet,
        }
    }

    /// Measures every mnemonic, or just `only`, and returns the records.
    pub fn run(&mut self, only: Option<&str>) -> Result<Vec<InstRecord>, RunError> {
        let group_indices: Vec<usize> = match only {
            Some(name) => {
                let idx = self
                    .db
                    .groups()
                    .iter()
                    .position(|g| g.name == name)
                    .ok_or_else(|| RunError::UnknownInstruction(name.to_string()))?;
                vec![idx]
            }
            None => (0..self.db.groups().len()).collect(),
        };

        let mut records = Vec::new();
        for idx in group_indices {
            let name = self.db.groups()[idx].name.clone();
            if db::is_ignored(&name) {
                continue;
            }
            let shapes = self.classify(&self.db.groups()[idx]);
            for (code, spec) in shapes {
                self.test_instruction(&name, code, spec, &mut records);
            }
        }
        Ok(records)
    }

    /// Special cases first, generic signature enumeration otherwise.
    fn classify(&self, group: &MnemonicGroup) -> Vec<(Code, InstSpec)> {
        let name = group.name.as_str();

        if ZERO_OPERAND.contains(&name) {
            return group
                .codes
                .iter()
                .copied()
                .find(|c| c.op_code().op_count() == 0)
                .map(|c| vec![(c, InstSpec::new(&[]))])
                .unwrap_or_default();
        }

        match name {
            "call" => return self.call_shapes(group),
            "jmp" => {
                return self
                    .find_rel_code(group)
                    .map(|c| vec![(c, InstSpec::new(&[OperandKind::Rel]))])
                    .unwrap_or_default();
            }
            "lea" => return self.lea_shapes(group),
            _ => {}
        }

        let mut seen: FxHashSet<InstSpec> = FxHashSet::default();
        let mut shapes = Vec::new();
        for code in &group.codes {
            let Some(slots) = self.db.signature_slots(*code) else {
                continue;
            };
            for spec in SigIter::new(&slots, OpFlags::default_filter()) {
                if spec.iter().any(|k| k == OperandKind::Rel) {
                    continue;
                }
                // Vector shapes have no kernel-only side effects; GP
                // shapes must be on the allow-list.
                if !spec.uses_vector_regs() && !db::is_safe_gp(name) {
                    continue;
                }
                if seen.insert(spec) {
                    shapes.push((*code, spec));
                }
            }
        }
        shapes
    }

    fn find_rel_code(&self, group: &MnemonicGroup) -> Option<Code> {
        let want = match self.arch {
            Arch::X86 => Code::Jmp_rel32_32,
            Arch::X64 => Code::Jmp_rel32_64,
        };
        group.codes.iter().copied().find(|c| *c == want)
    }

    fn call_shapes(&self, group: &MnemonicGroup) -> Vec<(Code, InstSpec)> {
        let (rel, rm, reg_kind, mem_kind) = match self.arch {
            Arch::X86 => (
                Code::Call_rel32_32,
                Code::Call_rm32,
                OperandKind::R32,
                OperandKind::M32,
            ),
            Arch::X64 => (
                Code::Call_rel32_64,
                Code::Call_rm64,
                OperandKind::R64,
                OperandKind::M64,
            ),
        };
        let mut shapes = Vec::new();
        if group.codes.contains(&rel) {
            shapes.push((rel, InstSpec::new(&[OperandKind::Rel])));
        }
        if group.codes.contains(&rm) {
            shapes.push((rm, InstSpec::new(&[reg_kind])));
            shapes.push((rm, InstSpec::new(&[mem_kind])));
        }
        shapes
    }

    /// LEA probes the address-generation forms: base, base+disp,
    /// base+index, base+index+disp, each with and without a scale.
    fn lea_shapes(&self, group: &MnemonicGroup) -> Vec<(Code, InstSpec)> {
        let dsts: &[(Code, OperandKind)] = match self.arch {
            Arch::X86 => &[(Code::Lea_r32_m, OperandKind::R32)],
            Arch::X64 => &[
                (Code::Lea_r32_m, OperandKind::R32),
                (Code::Lea_r64_m, OperandKind::R64),
            ],
        };
        let mut shapes = Vec::new();
        for (code, dst) in dsts {
            if !group.codes.contains(code) {
                continue;
            }
            let r = *dst;
            let forms: &[&[OperandKind]] = &[
                &[r, r],
                &[r, r, OperandKind::I8],
                &[r, r, OperandKind::I32],
                &[r, r, r],
                &[r, r, r, OperandKind::I8],
                &[r, r, r, OperandKind::I32],
            ];
            for form in forms {
                shapes.push((*code, InstSpec::new(form)));
                // Scale only applies once an index register exists.
                if form.len() >= 3 && form[2] == r {
                    shapes.push((*code, InstSpec::with_flags(form, SpecFlags::LEA_SCALE)));
                }
            }
        }
        shapes
    }

    fn test_instruction(
        &mut self,
        name: &str,
        code: Code,
        spec: InstSpec,
        records: &mut Vec<InstRecord>,
    ) {
        // The hand-built branch/address shapes are baseline encodable;
        // everything else goes through the oracle.
        let special = matches!(name, "call" | "jmp" | "lea");
        if !special && !self.db.is_feasible(code, &spec, &self.cpu.feature_set) {
            return;
        }

        let write_only = self.db.is_write_only(code, &spec);

        let sweeps: &[(MemAlign, &str)] = if spec.mem_op().is_some()
            && self.db.is_safe_unaligned(name, &spec, code)
        {
            &[(MemAlign::Aligned, " {a}"), (MemAlign::Unaligned, " {u}")]
        } else {
            &[(MemAlign::Aligned, "")]
        };

        let masked = db::needs_evex_mask(code, &spec);
        for (align, align_suffix) in sweeps {
            let Some(lat) = self.measure(name, code, spec, ChainMode::Serial, *align, write_only)
            else {
                continue;
            };
            let Some(rcp) = self.measure(name, code, spec, ChainMode::Parallel, *align, false)
            else {
                continue;
            };

            // A parallel result above the serial one is pipelining
            // noise; the serial chain can never be faster.
            let lat = lat.max(rcp);
            let (lat, rcp) = if self.config.round {
                (round_cycles(lat), round_cycles(rcp))
            } else {
                (lat, rcp)
            };

            let mut text = record_text(name, &spec);
            if masked {
                text.push_str(" {k}");
            }
            text.push_str(align_suffix);

            if !self.quiet {
                eprintln!("{text:<44} lat: {lat:6.2}  rcp: {rcp:6.2}");
            }
            records.push(InstRecord {
                inst: text,
                lat: round2(lat),
                rcp: round2(rcp),
            });
        }
    }

    /// Assembles, compiles and measures one probe pair (instruction and
    /// overhead twin); returns the overhead-subtracted estimate, or
    /// `None` if the shape failed to assemble.
    fn measure(
        &mut self,
        name: &str,
        code: Code,
        spec: InstSpec,
        mode: ChainMode,
        align: MemAlign,
        write_only: bool,
    ) -> Option<f64> {
        if spec.iter().any(|k| k.is_vm()) && self.arena.is_none() {
            self.arena = Some(Arena::new());
        }

        let ops = materialize(
            &spec,
            name,
            self.arch,
            mode,
            align,
            write_only && mode == ChainMode::Serial,
            UNROLL as usize,
            PARALLEL_WIDTH,
        );

        let rdtscp = self.cpu.feature_set.has(CpuidFeature::RDTSCP);
        let mut compiled = Vec::with_capacity(2);
        for with_inst in [true, false] {
            let req = ProbeRequest {
                code,
                name,
                spec,
                mode,
                align,
                with_inst,
                unroll: UNROLL,
                rdtscp,
            };
            let probe = match assemble_probe(&req, &ops, self.arena.as_ref(), self.arch) {
                Ok(probe) => probe,
                Err(err) => {
                    eprintln!("failed to assemble probe for '{name}': {err}");
                    return None;
                }
            };
            if self.config.dump && with_inst {
                dump_code(&probe.code.bytes, self.arch);
            }
            match probe.compile() {
                Ok(c) => compiled.push(c),
                Err(err) => {
                    eprintln!("failed to map probe for '{name}': {err}");
                    return None;
                }
            }
        }

        let mcfg = self.config.measure_config(name);
        let measured = run_minimum(&mcfg, &mut |iters| compiled[0].call(iters));
        let overhead = run_minimum(&mcfg, &mut |iters| compiled[1].call(iters));
        Some((measured - overhead).max(0.0))
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Report string for one shape: `"add r32, r32"`, `"call+ret"`,
/// `"lea r64, [r64 + r64 * 8]"`.
pub fn record_text(name: &str, spec: &InstSpec) -> String {
    if name == "call" {
        return match spec.get(0) {
            OperandKind::Rel => "call+ret".to_string(),
            kind => format!("call+ret {}", kind.name()),
        };
    }
    if name == "lea" {
        return lea_text(spec);
    }
    if spec.is_empty() {
        return name.to_string();
    }
    let kinds: Vec<&str> = spec.iter().map(|k| k.name()).collect();
    format!("{name} {}", kinds.join(", "))
}

fn lea_text(spec: &InstSpec) -> String {
    let dst = spec.get(0).name();
    let mut addr = spec.get(1).name().to_string();
    for kind in spec.iter().skip(2) {
        if kind.is_reg() {
            addr.push_str(&format!(" + {}", kind.name()));
            if spec.flags.contains(SpecFlags::LEA_SCALE) {
                addr.push_str(" * 8");
            }
        } else {
            addr.push_str(&format!(" + {}", kind.name()));
        }
    }
    format!("lea {dst}, [{addr}]")
}

/// Disassembles probe code to stderr.
fn dump_code(bytes: &[u8], arch: Arch) {
    let mut decoder = Decoder::with_ip(arch.bitness(), bytes, 0, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut line = String::new();
    while decoder.can_decode() {
        let inst = decoder.decode();
        line.clear();
        formatter.format(&inst, &mut line);
        eprintln!("  {:06x}  {line}", inst.ip());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> InstDb {
        InstDb::new(Arch::X64)
    }

    // Generic-enumeration path of `InstBench::classify`, without the
    // host-detection plumbing a full bench needs.
    fn classify(name: &str) -> Vec<(Code, InstSpec)> {
        let db = db();
        let group = db.find(name).expect("mnemonic exists");
        let mut seen: FxHashSet<InstSpec> = FxHashSet::default();
        let mut shapes = Vec::new();
        for code in &group.codes {
            let Some(slots) = db.signature_slots(*code) else {
                continue;
            };
            for spec in SigIter::new(&slots, OpFlags::default_filter()) {
                if spec.iter().any(|k| k == OperandKind::Rel) {
                    continue;
                }
                if !spec.uses_vector_regs() && !db::is_safe_gp(name) {
                    continue;
                }
                if seen.insert(spec) {
                    shapes.push((*code, spec));
                }
            }
        }
        shapes
    }

    #[test]
    fn add_shapes_are_unique_and_complete() {
        let shapes = classify("add");
        let specs: Vec<InstSpec> = shapes.iter().map(|(_, s)| *s).collect();
        let mut dedup: FxHashSet<InstSpec> = FxHashSet::default();
        for spec in &specs {
            assert!(dedup.insert(*spec), "duplicate shape {spec:?}");
        }
        for expected in [
            InstSpec::new(&[OperandKind::R32, OperandKind::R32]),
            InstSpec::new(&[OperandKind::R64, OperandKind::R64]),
            InstSpec::new(&[OperandKind::R32, OperandKind::I8]),
            InstSpec::new(&[OperandKind::R32, OperandKind::I32]),
            InstSpec::new(&[OperandKind::R32, OperandKind::M32]),
        ] {
            assert!(specs.contains(&expected), "missing {expected:?}");
        }
    }

    #[test]
    fn unsafe_gp_mnemonics_produce_no_shapes() {
        assert!(classify("wrmsr").is_empty());
        assert!(classify("cli").is_empty());
        assert!(classify("hlt").is_empty());
    }

    #[test]
    fn record_text_formats() {
        let add = InstSpec::new(&[OperandKind::R32, OperandKind::R32]);
        assert_eq!(record_text("add", &add), "add r32, r32");

        assert_eq!(record_text("lfence", &InstSpec::new(&[])), "lfence");

        assert_eq!(
            record_text("call", &InstSpec::new(&[OperandKind::Rel])),
            "call+ret"
        );
        assert_eq!(
            record_text("call", &InstSpec::new(&[OperandKind::R64])),
            "call+ret r64"
        );

        let lea = InstSpec::with_flags(
            &[OperandKind::R32, OperandKind::R32, OperandKind::R32],
            SpecFlags::LEA_SCALE,
        );
        assert_eq!(record_text("lea", &lea), "lea r32, [r32 + r32 * 8]");

        let lea_disp = InstSpec::new(&[
            OperandKind::R64,
            OperandKind::R64,
            OperandKind::R64,
            OperandKind::I32,
        ]);
        assert_eq!(record_text("lea", &lea_disp), "lea r64, [r64 + r64 + i32]");
    }
}
