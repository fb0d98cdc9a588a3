//! Bridge between the measurement core and the instruction database.
//!
//! Each [`Code`] value is one database signature: a fixed list of
//! operand kinds plus encoding, mode and CPUID-feature metadata. The
//! bridge groups codes by mnemonic (what users and the report name),
//! expands signatures into per-slot [`OpFlags`] sets for the odometer,
//! and answers the feasibility question: can this host encode and
//! execute the instruction with operands of a given shape?

use iced_x86::{
    Code, EncodingKind, IcedError, Instruction, InstructionInfoFactory, MemoryOperand, Mnemonic,
    OpAccess, OpCodeOperandKind, Register,
};
use rustc_hash::FxHashMap;

use cult_cpu::FeatureSet;

use crate::inst_spec::{InstSpec, OperandKind};
use crate::regs::Arch;
use crate::sig_iter::OpFlags;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("encoding rejected: {0}")]
    Iced(#[from] IcedError),
    #[error("unsupported operand pattern")]
    Unsupported,
}

/// A concrete operand handed to the instruction builder.
#[derive(Debug, Clone, Copy)]
pub enum AsmOperand {
    Reg(Register),
    Imm(i64),
    Mem(MemoryOperand),
}

/// One mnemonic and every signature the database has for it.
pub struct MnemonicGroup {
    pub name: String,
    pub mnemonic: Mnemonic,
    pub codes: Vec<Code>,
}

pub struct InstDb {
    arch: Arch,
    groups: Vec<MnemonicGroup>,
    by_name: FxHashMap<String, usize>,
}

impl InstDb {
    /// Indexes every code valid in the given mode, grouped by mnemonic.
    pub fn new(arch: Arch) -> InstDb {
        let mut index: FxHashMap<Mnemonic, Vec<Code>> = FxHashMap::default();
        for code in Code::values() {
            let op = code.op_code();
            if !op.is_instruction() {
                continue;
            }
            let mode_ok = match arch {
                Arch::X86 => op.mode32(),
                Arch::X64 => op.mode64(),
            };
            if !mode_ok {
                continue;
            }
            index.entry(code.mnemonic()).or_default().push(code);
        }

        let mut groups: Vec<MnemonicGroup> = index
            .into_iter()
            .map(|(mnemonic, codes)| MnemonicGroup {
                name: format!("{mnemonic:?}").to_lowercase(),
                mnemonic,
                codes,
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        let by_name = groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.clone(), i))
            .collect();

        InstDb {
            arch,
            groups,
            by_name,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn groups(&self) -> &[MnemonicGroup] {
        &self.groups
    }

    pub fn find(&self, name: &str) -> Option<&MnemonicGroup> {
        self.by_name.get(name).map(|i| &self.groups[*i])
    }

    /// Per-slot operand-kind sets for one signature, or `None` when any
    /// slot uses a kind the core does not materialize (segment and
    /// control registers, far pointers, string-op implicits, ...). A
    /// skipped signature skips the whole tuple, never part of it.
    pub fn signature_slots(&self, code: Code) -> Option<Vec<OpFlags>> {
        let op = code.op_code();
        let count = op.op_count() as usize;
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(self.op_kind_flags(code, op.op_kind(i as u32))?);
        }
        Some(slots)
    }

    fn mem_flag(&self, code: Code) -> Option<OpFlags> {
        let mut tmp = Instruction::default();
        tmp.set_code(code);
        match tmp.memory_size().size() {
            1 => Some(OpFlags::M8),
            2 => Some(OpFlags::M16),
            4 => Some(OpFlags::M32),
            8 => Some(OpFlags::M64),
            16 => Some(OpFlags::M128),
            32 => Some(OpFlags::M256),
            64 => Some(OpFlags::M512),
            _ => None,
        }
    }

    fn op_kind_flags(&self, code: Code, kind: OpCodeOperandKind) -> Option<OpFlags> {
        use OpCodeOperandKind::*;
        Some(match kind {
            r8_reg | r8_opcode => OpFlags::R8,
            r16_reg | r16_rm | r16_opcode => OpFlags::R16,
            r32_reg | r32_rm | r32_opcode | r32_vvvv => OpFlags::R32,
            r64_reg | r64_rm | r64_opcode | r64_vvvv => OpFlags::R64,

            r8_or_mem => OpFlags::R8 | self.mem_flag(code)?,
            r16_or_mem => OpFlags::R16 | self.mem_flag(code)?,
            r32_or_mem => OpFlags::R32 | self.mem_flag(code)?,
            r64_or_mem => OpFlags::R64 | self.mem_flag(code)?,

            al => OpFlags::AL,
            cl => OpFlags::CL,
            ax => OpFlags::AX,
            dx => OpFlags::DX,
            eax => OpFlags::EAX,
            rax => OpFlags::RAX,

            imm8 | imm8sex16 | imm8sex32 | imm8sex64 => OpFlags::I8,
            imm16 => OpFlags::I16,
            imm32 | imm32sex64 => OpFlags::I32,
            imm64 => OpFlags::I64,

            mm_reg | mm_rm => OpFlags::MM,
            mm_or_mem => OpFlags::MM | self.mem_flag(code)?,

            xmm_reg | xmm_rm | xmm_vvvv | xmm_is4 | xmm_is5 => OpFlags::XMM,
            xmm_or_mem => OpFlags::XMM | self.mem_flag(code)?,
            ymm_reg | ymm_rm | ymm_vvvv | ymm_is4 | ymm_is5 => OpFlags::YMM,
            ymm_or_mem => OpFlags::YMM | self.mem_flag(code)?,
            zmm_reg | zmm_rm | zmm_vvvv => OpFlags::ZMM,
            zmm_or_mem => OpFlags::ZMM | self.mem_flag(code)?,

            k_reg | k_rm | k_vvvv | kp1_reg => OpFlags::K,
            k_or_mem => OpFlags::K | self.mem_flag(code)?,

            mem => self.mem_flag(code)?,
            mem_vsib32x => OpFlags::VM32X,
            mem_vsib32y => OpFlags::VM32Y,
            mem_vsib32z => OpFlags::VM32Z,
            mem_vsib64x => OpFlags::VM64X,
            mem_vsib64y => OpFlags::VM64Y,
            mem_vsib64z => OpFlags::VM64Z,

            br32_4 | br64_4 => OpFlags::REL,

            _ => return Option::None,
        })
    }

    /// Representative concrete operands for encoding validation, the
    /// probe-independent analogue of what the emitter will produce.
    fn check_operands(&self, spec: &InstSpec) -> Option<Vec<AsmOperand>> {
        let base = match self.arch {
            Arch::X86 => Register::EAX,
            Arch::X64 => Register::RAX,
        };
        let mut ops = Vec::with_capacity(spec.count());
        for (i, kind) in spec.iter().enumerate() {
            let op = if let Some(class) = kind.reg_class() {
                let id = kind.fixed_reg_id().unwrap_or(i as u32);
                AsmOperand::Reg(crate::regs::reg(self.arch, class, id))
            } else if kind.is_imm() {
                AsmOperand::Imm(1)
            } else if kind.is_mem() {
                AsmOperand::Mem(MemoryOperand::new(
                    base,
                    Register::None,
                    1,
                    0,
                    0,
                    false,
                    Register::None,
                ))
            } else if let Some(class) = kind.vm_index_class() {
                let index = crate::regs::reg(self.arch, class, self.arch.vm_index_id());
                AsmOperand::Mem(MemoryOperand::new(
                    base,
                    index,
                    1,
                    0,
                    0,
                    false,
                    Register::None,
                ))
            } else {
                // Rel operands validate through the branch constructor.
                return None;
            };
            ops.push(op);
        }
        Some(ops)
    }

    fn check_instruction(&self, code: Code, spec: &InstSpec) -> Result<Instruction, BuildError> {
        if spec.count() == 1 && spec.get(0) == OperandKind::Rel {
            return Ok(Instruction::with_branch(code, 0)?);
        }
        let ops = self.check_operands(spec).ok_or(BuildError::Unsupported)?;
        let mut inst = build_instruction(code, &ops)?;
        if needs_evex_mask(code, spec) {
            inst.set_op_mask(Register::K7);
        }
        Ok(inst)
    }

    /// Feasibility oracle: the host architecture must encode the shape
    /// and the host CPU must have every feature the signature requires.
    pub fn is_feasible(&self, code: Code, spec: &InstSpec, features: &FeatureSet) -> bool {
        let inst = match self.check_instruction(code, spec) {
            Ok(inst) => inst,
            Err(_) => return false,
        };
        let mut encoder = iced_x86::Encoder::new(self.arch.bitness());
        if encoder.encode(&inst, 0).is_err() {
            return false;
        }
        features.supports_all(inst.cpuid_features())
    }

    /// True when a serial rotation cannot observe the destination: the
    /// first operand is written but its kind never appears among the
    /// source slots (`pop r64`, `shl r64, i8`, `mov r64, i64`). Such
    /// probes must append an artificial consumer or the chain falls
    /// apart.
    pub fn is_write_only(&self, code: Code, spec: &InstSpec) -> bool {
        let dest = spec.get(0);
        if !dest.is_reg() && !dest.is_mem() {
            return false;
        }
        let inst = match self.check_instruction(code, spec) {
            Ok(inst) => inst,
            Err(_) => return false,
        };
        let mut factory = InstructionInfoFactory::new();
        match factory.info(&inst).op0_access() {
            OpAccess::Write => true,
            OpAccess::ReadWrite | OpAccess::CondWrite | OpAccess::ReadCondWrite => {
                !spec.iter().skip(1).any(|k| k == dest)
            }
            _ => false,
        }
    }

    /// Whether the memory form may be probed at `base + 1` without
    /// faulting: aligned-only vector moves and non-temporal stores
    /// #GP on misalignment.
    pub fn is_safe_unaligned(&self, name: &str, spec: &InstSpec, code: Code) -> bool {
        if name == "nop" {
            return false;
        }
        let Some(mem) = spec.mem_op() else {
            return false;
        };
        match code.op_code().encoding() {
            EncodingKind::Legacy => {
                if spec.uses_vector_regs() {
                    matches!(name, "movdqu" | "movupd" | "movups") || mem != OperandKind::M128
                } else {
                    true
                }
            }
            EncodingKind::VEX | EncodingKind::EVEX => !matches!(
                name,
                "vmovapd"
                    | "vmovaps"
                    | "vmovdqa"
                    | "vmovdqa32"
                    | "vmovdqa64"
                    | "vmovntdq"
                    | "vmovntdqa"
                    | "vmovntpd"
                    | "vmovntps"
            ),
            EncodingKind::XOP | EncodingKind::D3NOW => true,
            _ => false,
        }
    }
}

/// EVEX gather/scatter forms take their mask from the opmask field
/// rather than an operand slot; probes bind it to K7.
pub fn needs_evex_mask(code: Code, spec: &InstSpec) -> bool {
    code.op_code().encoding() == EncodingKind::EVEX
        && spec.iter().any(|k| k.is_vm())
}

/// General-purpose instructions safe to execute in a user-mode probe.
/// Anything not listed here and not using vector registers is skipped:
/// the instruction set is full of system, I/O and string instructions
/// whose side effects a probe must not trigger.
pub fn is_safe_gp(name: &str) -> bool {
    matches!(
        name,
        "adc" | "adcx"
            | "add"
            | "adox"
            | "and"
            | "andn"
            | "bextr"
            | "blcfill"
            | "blci"
            | "blcic"
            | "blcmsk"
            | "blcs"
            | "blsfill"
            | "blsi"
            | "blsic"
            | "blsmsk"
            | "blsr"
            | "bsf"
            | "bsr"
            | "bswap"
            | "bt"
            | "btc"
            | "btr"
            | "bts"
            | "bzhi"
            | "cbw"
            | "cdq"
            | "cdqe"
            | "cmp"
            | "cqo"
            | "crc32"
            | "cwd"
            | "cwde"
            | "dec"
            | "div"
            | "idiv"
            | "imul"
            | "inc"
            | "lzcnt"
            | "mov"
            | "movbe"
            | "movsx"
            | "movsxd"
            | "movzx"
            | "mul"
            | "mulx"
            | "neg"
            | "nop"
            | "not"
            | "or"
            | "pdep"
            | "pext"
            | "pop"
            | "popcnt"
            | "push"
            | "rcl"
            | "rcr"
            | "rdrand"
            | "rdseed"
            | "rol"
            | "ror"
            | "rorx"
            | "sar"
            | "sarx"
            | "sbb"
            | "shl"
            | "shld"
            | "shlx"
            | "shr"
            | "shrd"
            | "shrx"
            | "sub"
            | "t1mskc"
            | "test"
            | "tzcnt"
            | "tzmsk"
            | "xadd"
            | "xchg"
            | "xor"
    )
}

/// Instructions whose register constraints the materializer cannot
/// satisfy yet.
pub fn is_ignored(name: &str) -> bool {
    matches!(name, "vp2intersectd" | "vp2intersectq")
}

/// Index element width of a gather, or 0 for non-gathers.
pub fn gather_index_bits(name: &str) -> u32 {
    match name {
        "vgatherdps" | "vgatherdpd" | "vpgatherdd" | "vpgatherdq" => 32,
        "vgatherqps" | "vgatherqpd" | "vpgatherqd" | "vpgatherqq" => 64,
        _ => 0,
    }
}

/// Index element width of a scatter, or 0 for non-scatters.
pub fn scatter_index_bits(name: &str) -> u32 {
    match name {
        "vscatterdps" | "vscatterdpd" | "vpscatterdd" | "vpscatterdq" => 32,
        "vscatterqps" | "vscatterqpd" | "vpscatterqd" | "vpscatterqq" => 64,
        _ => 0,
    }
}

/// Data element width of a scatter, or 0 for non-scatters.
pub fn scatter_element_bits(name: &str) -> u32 {
    match name {
        "vscatterdps" | "vscatterqps" | "vpscatterdd" | "vpscatterqd" => 32,
        "vscatterdpd" | "vscatterqpd" | "vpscatterdq" | "vpscatterqq" => 64,
        _ => 0,
    }
}

/// Data element width of a gather, or 0 for non-gathers.
pub fn gather_element_bits(name: &str) -> u32 {
    match name {
        "vgatherdps" | "vgatherqps" | "vpgatherdd" | "vpgatherqd" => 32,
        "vgatherdpd" | "vgatherqpd" | "vpgatherdq" | "vpgatherqq" => 64,
        _ => 0,
    }
}

/// Builds an instruction from a code and concrete operands. The arms
/// cover every operand pattern the database signatures produce after
/// filtering; anything else is reported as unsupported and the driver
/// skips the descriptor.
pub fn build_instruction(code: Code, ops: &[AsmOperand]) -> Result<Instruction, BuildError> {
    use AsmOperand::{Imm, Mem, Reg};

    // Immediates are always small; pass them through the sign-extending
    // i32 constructors, which fit every immediate width in the database.
    let inst = match *ops {
        [] => Instruction::with(code),

        [Reg(a)] => Instruction::with1(code, a)?,
        [Imm(a)] => Instruction::with1(code, a as i32)?,
        [Mem(a)] => Instruction::with1(code, a)?,

        [Reg(a), Reg(b)] => Instruction::with2(code, a, b)?,
        [Reg(a), Imm(b)] => Instruction::with2(code, a, b as i32)?,
        [Reg(a), Mem(b)] => Instruction::with2(code, a, b)?,
        [Mem(a), Reg(b)] => Instruction::with2(code, a, b)?,
        [Mem(a), Imm(b)] => Instruction::with2(code, a, b as i32)?,

        [Reg(a), Reg(b), Reg(c)] => Instruction::with3(code, a, b, c)?,
        [Reg(a), Reg(b), Imm(c)] => Instruction::with3(code, a, b, c as i32)?,
        [Reg(a), Reg(b), Mem(c)] => Instruction::with3(code, a, b, c)?,
        [Reg(a), Mem(b), Reg(c)] => Instruction::with3(code, a, b, c)?,
        [Reg(a), Mem(b), Imm(c)] => Instruction::with3(code, a, b, c as i32)?,
        [Mem(a), Reg(b), Reg(c)] => Instruction::with3(code, a, b, c)?,
        [Mem(a), Reg(b), Imm(c)] => Instruction::with3(code, a, b, c as i32)?,

        [Reg(a), Reg(b), Reg(c), Reg(d)] => Instruction::with4(code, a, b, c, d)?,
        [Reg(a), Reg(b), Reg(c), Imm(d)] => Instruction::with4(code, a, b, c, d as i32)?,
        [Reg(a), Reg(b), Reg(c), Mem(d)] => Instruction::with4(code, a, b, c, d)?,
        [Reg(a), Reg(b), Mem(c), Reg(d)] => Instruction::with4(code, a, b, c, d)?,
        [Reg(a), Reg(b), Mem(c), Imm(d)] => Instruction::with4(code, a, b, c, d as i32)?,

        [Reg(a), Reg(b), Reg(c), Reg(d), Imm(e)] => {
            Instruction::with5(code, a, b, c, d, e as i32)?
        }
        [Reg(a), Reg(b), Reg(c), Mem(d), Imm(e)] => {
            Instruction::with5(code, a, b, c, d, e as i32)?
        }
        [Reg(a), Reg(b), Mem(c), Reg(d), Imm(e)] => {
            Instruction::with5(code, a, b, c, d, e as i32)?
        }

        _ => return Err(BuildError::Unsupported),
    };
    Ok(inst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig_iter::SigIter;

    fn db() -> InstDb {
        InstDb::new(Arch::X64)
    }

    #[test]
    fn groups_are_indexed_by_lowercase_mnemonic() {
        let db = db();
        assert!(db.find("add").is_some());
        assert!(db.find("vaddps").is_some());
        assert!(db.find("no_such_instruction").is_none());
    }

    #[test]
    fn add_signatures_cover_the_basic_gpr_shapes() {
        let db = db();
        let group = db.find("add").unwrap();
        let mut specs = Vec::new();
        for code in &group.codes {
            if let Some(slots) = db.signature_slots(*code) {
                for spec in SigIter::new(&slots, OpFlags::default_filter()) {
                    if !specs.contains(&spec) {
                        specs.push(spec);
                    }
                }
            }
        }
        for shape in [
            [OperandKind::R8, OperandKind::R8],
            [OperandKind::R16, OperandKind::R16],
            [OperandKind::R32, OperandKind::R32],
            [OperandKind::R64, OperandKind::R64],
            [OperandKind::R32, OperandKind::I8],
            [OperandKind::R32, OperandKind::I32],
        ] {
            let spec = InstSpec::new(&shape);
            assert!(specs.contains(&spec), "missing {shape:?}");
        }
    }

    #[test]
    fn feasibility_rejects_missing_features() {
        let db = db();
        let group = db.find("vaddps").unwrap();
        let spec = InstSpec::new(&[OperandKind::Xmm, OperandKind::Xmm, OperandKind::Xmm]);
        let code = group
            .codes
            .iter()
            .copied()
            .find(|c| {
                db.signature_slots(*c)
                    .map(|s| {
                        SigIter::new(&s, OpFlags::default_filter()).any(|candidate| candidate == spec)
                    })
                    .unwrap_or(false)
            })
            .expect("vaddps xmm, xmm, xmm signature");

        assert!(db.is_feasible(code, &spec, &FeatureSet::permissive()));
        assert!(!db.is_feasible(code, &spec, &FeatureSet::new()));
    }

    #[test]
    fn pop_is_write_only_and_add_is_not() {
        let db = db();
        let pop_spec = InstSpec::new(&[OperandKind::R64]);
        let pop = db
            .find("pop")
            .unwrap()
            .codes
            .iter()
            .copied()
            .find(|c| {
                db.signature_slots(*c)
                    .map(|s| SigIter::new(&s, OpFlags::default_filter()).any(|x| x == pop_spec))
                    .unwrap_or(false)
            })
            .unwrap();
        assert!(db.is_write_only(pop, &pop_spec));

        let add_spec = InstSpec::new(&[OperandKind::R32, OperandKind::R32]);
        let add = db
            .find("add")
            .unwrap()
            .codes
            .iter()
            .copied()
            .find(|c| {
                db.signature_slots(*c)
                    .map(|s| SigIter::new(&s, OpFlags::default_filter()).any(|x| x == add_spec))
                    .unwrap_or(false)
            })
            .unwrap();
        assert!(!db.is_write_only(add, &add_spec));
    }

    #[test]
    fn unaligned_safety_follows_the_move_tables() {
        let db = db();
        let movups_spec = InstSpec::new(&[OperandKind::Xmm, OperandKind::M128]);
        assert!(db.is_safe_unaligned("movups", &movups_spec, Code::Movups_xmm_xmmm128));
        assert!(!db.is_safe_unaligned("movaps", &movups_spec, Code::Movaps_xmm_xmmm128));

        let gp_spec = InstSpec::new(&[OperandKind::R32, OperandKind::M32]);
        assert!(db.is_safe_unaligned("add", &gp_spec, Code::Add_r32_rm32));
    }

    #[test]
    fn gather_scatter_tables_agree_with_mnemonic_names() {
        assert_eq!(gather_index_bits("vgatherdps"), 32);
        assert_eq!(gather_index_bits("vpgatherqq"), 64);
        assert_eq!(gather_index_bits("vaddps"), 0);
        assert_eq!(scatter_index_bits("vscatterqpd"), 64);
        assert_eq!(scatter_element_bits("vpscatterdq"), 64);
        assert_eq!(scatter_element_bits("vscatterqps"), 32);
    }

    #[test]
    fn safe_list_is_gp_only() {
        assert!(is_safe_gp("add"));
        assert!(is_safe_gp("xchg"));
        assert!(!is_safe_gp("wrmsr"));
        assert!(!is_safe_gp("cli"));
        assert!(!is_safe_gp("vaddps"));
    }
}
