//! Probe emission: the timed function around one unrolled instruction
//! sequence, plus its overhead twin.
//!
//! Every probe shares one frame: callee-saved registers are preserved,
//! the stack is realigned to 64 bytes with a scratch area for memory
//! operands, EBP carries the iteration count and the out-pointer lives
//! in a stack slot. The measured window is bracketed with
//! `mfence; lfence; rdtsc` at the start and `rdtscp; lfence` (or
//! `lfence; rdtsc` without RDTSCP) at the end.
//!
//! The overhead twin emits the identical frame, pre-body setup,
//! per-instance helpers and loop control, omitting only the measured
//! instruction itself, so subtracting its reading isolates the
//! instruction cost.

use iced_x86::{Code, EncodingKind, Instruction, MemoryOperand, Register};

use cult_jit::{CodeRegion, ExecRegion, JitError};

use crate::arena::Arena;
use crate::asm::{Asm, AsmCode, AsmError, Label};
use crate::db::{self, build_instruction, AsmOperand, BuildError};
use crate::harness::{ChainMode, MemAlign};
use crate::inst_spec::{InstSpec, OperandKind, RegClass};
use crate::materialize::{ConcOp, Materialized, SCRATCH_BYTES};
use crate::regs::Arch;

/// Stack-slot layout above the scratch area. The 64-byte gap keeps the
/// widest unaligned store (m512 at offset 4033) off the bookkeeping
/// slots.
const OFF_OUT: u32 = SCRATCH_BYTES + 64;
const OFF_SAVED_SP: u32 = SCRATCH_BYTES + 72;
const OFF_TSC_LO: u32 = SCRATCH_BYTES + 80;
const OFF_TSC_HI: u32 = SCRATCH_BYTES + 84;
const FRAME_BYTES: i32 = SCRATCH_BYTES as i32 + 192;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Asm(#[from] AsmError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Jit(#[from] JitError),
}

/// One probe to assemble.
pub struct ProbeRequest<'a> {
    pub code: Code,
    pub name: &'a str,
    pub spec: InstSpec,
    pub mode: ChainMode,
    pub align: MemAlign,
    /// False assembles the overhead twin.
    pub with_inst: bool,
    pub unroll: u32,
    /// Host supports RDTSCP for the closing bracket.
    pub rdtscp: bool,
}

/// Assembled but not yet executable probe.
pub struct ProbeCode {
    pub code: AsmCode,
    /// Dependency-forcing consumers emitted (one per unroll slot when
    /// the destination is write-only and the chain is serial).
    pub dep_consumers: u32,
}

pub type ProbeFn = unsafe extern "C" fn(u32, *mut u64);

/// An executable probe. Holds the mapping; must not outlive its use.
pub struct CompiledProbe {
    region: ExecRegion,
}

impl CompiledProbe {
    pub fn call(&self, iterations: u32) -> u64 {
        let mut out = 0u64;
        let f: ProbeFn = unsafe { std::mem::transmute(self.region.entry()) };
        unsafe { f(iterations, &mut out) };
        out
    }
}

impl ProbeCode {
    pub fn compile(&self) -> Result<CompiledProbe, ProbeError> {
        let mut region = CodeRegion::with_code(&self.code.bytes)?;
        let base = region.base();
        self.code.apply_abs_fixups(region.as_mut_slice(), base);
        Ok(CompiledProbe {
            region: region.seal()?,
        })
    }
}

struct Emitter<'a> {
    a: Asm,
    req: &'a ProbeRequest<'a>,
    ops: &'a Materialized,
    arena: Option<&'a Arena>,
    tramp: Option<Label>,
    dep_consumers: u32,
}

pub fn assemble_probe(
    req: &ProbeRequest<'_>,
    ops: &Materialized,
    arena: Option<&Arena>,
    arch: Arch,
) -> Result<ProbeCode, ProbeError> {
    let mut e = Emitter {
        a: Asm::new(arch),
        req,
        ops,
        arena,
        tramp: None,
        dep_consumers: 0,
    };
    e.assemble()?;
    Ok(ProbeCode {
        code: e.a.finalize()?,
        dep_consumers: e.dep_consumers,
    })
}

impl<'a> Emitter<'a> {
    fn arch(&self) -> Arch {
        self.a.arch()
    }

    fn sp(&self) -> Register {
        self.arch().sp()
    }

    fn mem_sp(&self, offset: i64) -> MemoryOperand {
        let displ_size = if offset == 0 { 0 } else { 4 };
        MemoryOperand::new(self.sp(), Register::None, 1, offset, displ_size, false, Register::None)
    }

    fn emit(&mut self, inst: Instruction) -> Result<(), ProbeError> {
        self.a.emit(inst)?;
        Ok(())
    }

    fn mov_imm32(&mut self, reg: Register, value: i32) -> Result<(), ProbeError> {
        self.emit(Instruction::with2(Code::Mov_r32_imm32, reg, value).map_err(BuildError::from)?)
    }

    fn is_gather(&self) -> bool {
        db::gather_index_bits(self.req.name) != 0
    }

    fn is_scatter(&self) -> bool {
        db::scatter_index_bits(self.req.name) != 0
    }

    /// Index element width of the probe's vsib operand.
    fn vsib_index_bits(&self) -> u32 {
        self.req
            .spec
            .iter()
            .find(|k| k.is_vm())
            .map(|k| k.vm_index_bits())
            .unwrap_or(0)
    }

    /// Element scale applied to vector indices. Gather-prefetch and
    /// other forms outside the element tables scale by the index width.
    fn vsib_scale(&self) -> u32 {
        let bits = if self.is_gather() {
            db::gather_element_bits(self.req.name)
        } else if self.is_scatter() {
            db::scatter_element_bits(self.req.name)
        } else {
            self.vsib_index_bits()
        };
        (bits / 8).max(1)
    }

    /// Byte size moved by one push/pop instance.
    fn stack_op_size(&self) -> u32 {
        let op = self.req.spec.get(0);
        if let Some(class) = op.reg_class() {
            match class {
                RegClass::Gp16 => 2,
                _ => match self.arch() {
                    Arch::X86 => 4,
                    Arch::X64 => 8,
                },
            }
        } else if op.is_mem() {
            op.mem_size()
        } else if op.is_imm() {
            match self.arch() {
                Arch::X86 => 4,
                Arch::X64 => 8,
            }
        } else {
            0
        }
    }

    fn conv_op(&self, op: ConcOp) -> Result<AsmOperand, ProbeError> {
        Ok(match op {
            ConcOp::Reg(r) => AsmOperand::Reg(r),
            ConcOp::Imm(v) => AsmOperand::Imm(v),
            ConcOp::Mem { offset } => AsmOperand::Mem(self.mem_sp(i64::from(offset))),
            ConcOp::VecMem { index } => AsmOperand::Mem(MemoryOperand::new(
                self.arch().arena_base(),
                index,
                self.vsib_scale(),
                0,
                0,
                false,
                Register::None,
            )),
            ConcOp::Rel => return Err(BuildError::Unsupported.into()),
        })
    }

    fn assemble(&mut self) -> Result<(), ProbeError> {
        let arch = self.arch();

        self.prologue()?;
        self.before_body()?;

        // Serialize, then open the measured window.
        self.emit(Instruction::with(Code::Mfence))?;
        self.emit(Instruction::with(Code::Lfence))?;
        self.emit(Instruction::with(Code::Rdtsc))?;
        self.emit(
            Instruction::with2(
                Code::Mov_rm32_r32,
                self.mem_sp(i64::from(OFF_TSC_LO)),
                Register::EAX,
            )
            .map_err(BuildError::from)?,
        )?;
        self.emit(
            Instruction::with2(
                Code::Mov_rm32_r32,
                self.mem_sp(i64::from(OFF_TSC_HI)),
                Register::EDX,
            )
            .map_err(BuildError::from)?,
        )?;

        self.body()?;

        // Close the measured window.
        if self.req.rdtscp {
            self.emit(Instruction::with(Code::Rdtscp))?;
            self.emit(Instruction::with(Code::Lfence))?;
        } else {
            self.emit(Instruction::with(Code::Lfence))?;
            self.emit(Instruction::with(Code::Rdtsc))?;
        }

        // Reload the out pointer (the body may clobber any pool
        // register) and store the 64-bit TSC delta.
        let (out_reg, mov_out) = match arch {
            Arch::X86 => (Register::EBX, Code::Mov_r32_rm32),
            Arch::X64 => (Register::RBX, Code::Mov_r64_rm64),
        };
        self.emit(
            Instruction::with2(mov_out, out_reg, self.mem_sp(i64::from(OFF_OUT)))
                .map_err(BuildError::from)?,
        )?;
        self.emit(
            Instruction::with2(Code::Sub_r32_rm32, Register::EAX, self.mem_sp(i64::from(OFF_TSC_LO)))
                .map_err(BuildError::from)?,
        )?;
        self.emit(
            Instruction::with2(Code::Sbb_r32_rm32, Register::EDX, self.mem_sp(i64::from(OFF_TSC_HI)))
                .map_err(BuildError::from)?,
        )?;
        let out_lo = MemoryOperand::new(out_reg, Register::None, 1, 0, 0, false, Register::None);
        let out_hi = MemoryOperand::new(out_reg, Register::None, 1, 4, 1, false, Register::None);
        self.emit(Instruction::with2(Code::Mov_rm32_r32, out_lo, Register::EAX).map_err(BuildError::from)?)?;
        self.emit(Instruction::with2(Code::Mov_rm32_r32, out_hi, Register::EDX).map_err(BuildError::from)?)?;

        self.after_body()?;
        self.epilogue()?;
        Ok(())
    }

    fn prologue(&mut self) -> Result<(), ProbeError> {
        match self.arch() {
            Arch::X64 => {
                for r in [
                    Register::RBP,
                    Register::RBX,
                    Register::R12,
                    Register::R13,
                    Register::R14,
                    Register::R15,
                ] {
                    self.emit(Instruction::with1(Code::Push_r64, r).map_err(BuildError::from)?)?;
                }
                self.emit(
                    Instruction::with2(Code::Mov_r64_rm64, Register::RAX, Register::RSP)
                        .map_err(BuildError::from)?,
                )?;
                self.emit(
                    Instruction::with2(Code::Sub_rm64_imm32, Register::RSP, FRAME_BYTES)
                        .map_err(BuildError::from)?,
                )?;
                self.emit(
                    Instruction::with2(Code::And_rm64_imm8, Register::RSP, -64)
                        .map_err(BuildError::from)?,
                )?;
                self.emit(
                    Instruction::with2(
                        Code::Mov_rm64_r64,
                        self.mem_sp(i64::from(OFF_SAVED_SP)),
                        Register::RAX,
                    )
                    .map_err(BuildError::from)?,
                )?;
                // SysV: iteration count in EDI, out pointer in RSI.
                self.emit(
                    Instruction::with2(Code::Mov_r32_rm32, Register::EBP, Register::EDI)
                        .map_err(BuildError::from)?,
                )?;
                self.emit(
                    Instruction::with2(
                        Code::Mov_rm64_r64,
                        self.mem_sp(i64::from(OFF_OUT)),
                        Register::RSI,
                    )
                    .map_err(BuildError::from)?,
                )?;
            }
            Arch::X86 => {
                for r in [Register::EBP, Register::EBX, Register::ESI, Register::EDI] {
                    self.emit(Instruction::with1(Code::Push_r32, r).map_err(BuildError::from)?)?;
                }
                self.emit(
                    Instruction::with2(Code::Mov_r32_rm32, Register::EAX, Register::ESP)
                        .map_err(BuildError::from)?,
                )?;
                self.emit(
                    Instruction::with2(Code::Sub_rm32_imm32, Register::ESP, FRAME_BYTES)
                        .map_err(BuildError::from)?,
                )?;
                self.emit(
                    Instruction::with2(Code::And_rm32_imm8, Register::ESP, -64)
                        .map_err(BuildError::from)?,
                )?;
                self.emit(
                    Instruction::with2(
                        Code::Mov_rm32_r32,
                        self.mem_sp(i64::from(OFF_SAVED_SP)),
                        Register::EAX,
                    )
                    .map_err(BuildError::from)?,
                )?;
                // cdecl: args live above the four saved registers.
                let arg = |off: i64| {
                    MemoryOperand::new(Register::EAX, Register::None, 1, off, 1, false, Register::None)
                };
                self.emit(
                    Instruction::with2(Code::Mov_r32_rm32, Register::EBP, arg(20))
                        .map_err(BuildError::from)?,
                )?;
                self.emit(
                    Instruction::with2(Code::Mov_r32_rm32, Register::ECX, arg(24))
                        .map_err(BuildError::from)?,
                )?;
                self.emit(
                    Instruction::with2(
                        Code::Mov_rm32_r32,
                        self.mem_sp(i64::from(OFF_OUT)),
                        Register::ECX,
                    )
                    .map_err(BuildError::from)?,
                )?;
            }
        }
        Ok(())
    }

    fn epilogue(&mut self) -> Result<(), ProbeError> {
        match self.arch() {
            Arch::X64 => {
                self.emit(
                    Instruction::with2(Code::Mov_r64_rm64, Register::RSP, self.mem_sp(i64::from(OFF_SAVED_SP)))
                        .map_err(BuildError::from)?,
                )?;
                for r in [
                    Register::R15,
                    Register::R14,
                    Register::R13,
                    Register::R12,
                    Register::RBX,
                    Register::RBP,
                ] {
                    self.emit(Instruction::with1(Code::Pop_r64, r).map_err(BuildError::from)?)?;
                }
                self.emit(Instruction::with(Code::Retnq))?;
            }
            Arch::X86 => {
                self.emit(
                    Instruction::with2(Code::Mov_r32_rm32, Register::ESP, self.mem_sp(i64::from(OFF_SAVED_SP)))
                        .map_err(BuildError::from)?,
                )?;
                for r in [Register::EDI, Register::ESI, Register::EBX, Register::EBP] {
                    self.emit(Instruction::with1(Code::Pop_r32, r).map_err(BuildError::from)?)?;
                }
                self.emit(Instruction::with(Code::Retnd))?;
            }
        }
        Ok(())
    }

    /// Pre-window setup: predictable scalar state, the divider fill,
    /// arena pointers and vector indices, the call target.
    fn before_body(&mut self) -> Result<(), ProbeError> {
        let arch = self.arch();
        let name = self.req.name;

        if matches!(name, "div" | "idiv") {
            self.fill_scratch()?;
        }

        // Known small values; architecturally undefined inputs cause
        // variable-latency stalls on some cores.
        let inits = [
            (Register::EAX, 1),
            (Register::EBX, 2),
            (Register::ECX, 3),
            (Register::EDX, 4),
            (Register::ESI, 5),
            (Register::EDI, 6),
        ];
        for (r, v) in inits {
            self.mov_imm32(r, v)?;
        }
        if arch == Arch::X64 && matches!(name, "bt" | "btc" | "btr" | "bts") {
            let high = [
                (Register::R8D, 7),
                (Register::R9D, 8),
                (Register::R10D, 9),
                (Register::R11D, 10),
                (Register::R12D, 11),
                (Register::R13D, 12),
                (Register::R14D, 13),
                (Register::R15D, 14),
            ];
            for (r, v) in high {
                self.mov_imm32(r, v)?;
            }
        }

        // XGETBV faults on any XCR the OS did not implement.
        if name == "xgetbv" {
            self.emit(
                Instruction::with2(Code::Xor_r32_rm32, Register::ECX, Register::ECX)
                    .map_err(BuildError::from)?,
            )?;
        }

        if self.req.spec.iter().any(|k| k.is_vm()) {
            self.setup_vsib()?;
        }

        if name == "call" {
            self.setup_call_target()?;
        }

        Ok(())
    }

    /// Fills the scratch area with a harmless divisor pattern.
    fn fill_scratch(&mut self) -> Result<(), ProbeError> {
        let arch = self.arch();
        let counter = match arch {
            Arch::X86 => Register::ECX,
            Arch::X64 => Register::RCX,
        };
        self.mov_imm32(Register::ECX, (SCRATCH_BYTES / 4) as i32)?;
        let top = self.a.new_label();
        self.a.bind(top);
        let slot = MemoryOperand::new(self.sp(), counter, 4, -4, 4, false, Register::None);
        self.emit(
            Instruction::with2(Code::Mov_rm32_imm32, slot, 0x0303_0303)
                .map_err(BuildError::from)?,
        )?;
        self.emit(
            Instruction::with2(Code::Sub_rm32_imm8, Register::ECX, 1).map_err(BuildError::from)?,
        )?;
        self.branch(jne_code(arch), top)?;
        Ok(())
    }

    fn branch(&mut self, code: Code, label: Label) -> Result<(), ProbeError> {
        self.a.branch(code, label)?;
        Ok(())
    }

    /// Loads the arena base and the vector-index register; scatters
    /// additionally build their constant-stride index vector on the
    /// stack first.
    fn setup_vsib(&mut self) -> Result<(), ProbeError> {
        let arch = self.arch();
        let arena = self.arena.expect("vsib probes need the arena");
        let index_bits = self.vsib_index_bits();
        let base = arena.base_ptr(index_bits, self.req.align);

        let base_reg = arch.arena_base();
        match arch {
            Arch::X64 => self.emit(
                Instruction::with2(Code::Mov_r64_imm64, base_reg, base)
                    .map_err(BuildError::from)?,
            )?,
            Arch::X86 => self.emit(
                Instruction::with2(Code::Mov_r32_imm32, base_reg, base as u32)
                    .map_err(BuildError::from)?,
            )?,
        }

        let vm = self
            .req
            .spec
            .iter()
            .find(|k| k.is_vm())
            .expect("vsib setup without a vm operand");
        let class = vm.vm_index_class().unwrap();
        let index_reg = crate::regs::reg(arch, class, arch.vm_index_id());

        if !self.is_scatter() {
            // Index lanes come straight from the arena's random table.
            let src = MemoryOperand::new(base_reg, Register::None, 1, 0, 0, false, Register::None);
            let load = match class {
                RegClass::Xmm => Code::VEX_Vmovdqu_xmm_xmmm128,
                RegClass::Ymm => Code::VEX_Vmovdqu_ymm_ymmm256,
                _ => Code::EVEX_Vmovdqu32_zmm_k1z_zmmm512,
            };
            self.emit(Instruction::with2(load, index_reg, src).map_err(BuildError::from)?)?;
        } else {
            // Scatter indices: lane * 4, so the stores stay disjoint.
            let lane_bytes = index_bits / 8;
            let vec_bytes = match class {
                RegClass::Xmm => 16,
                RegClass::Ymm => 32,
                _ => 64,
            };
            let lanes = vec_bytes / lane_bytes;
            for lane in 0..lanes {
                let off = i64::from(lane * lane_bytes);
                self.emit(
                    Instruction::with2(
                        Code::Mov_rm32_imm32,
                        self.mem_sp(off),
                        (lane * 4) as i32,
                    )
                    .map_err(BuildError::from)?,
                )?;
                if lane_bytes == 8 {
                    self.emit(
                        Instruction::with2(Code::Mov_rm32_imm32, self.mem_sp(off + 4), 0)
                            .map_err(BuildError::from)?,
                    )?;
                }
            }
            let src = self.mem_sp(0);
            let load = match (class, index_bits) {
                (RegClass::Xmm, 32) => Code::EVEX_Vmovdqu32_xmm_k1z_xmmm128,
                (RegClass::Xmm, _) => Code::EVEX_Vmovdqu64_xmm_k1z_xmmm128,
                (RegClass::Ymm, 32) => Code::EVEX_Vmovdqu32_ymm_k1z_ymmm256,
                (RegClass::Ymm, _) => Code::EVEX_Vmovdqu64_ymm_k1z_ymmm256,
                (_, 32) => Code::EVEX_Vmovdqu32_zmm_k1z_zmmm512,
                (_, _) => Code::EVEX_Vmovdqu64_zmm_k1z_zmmm512,
            };
            self.emit(Instruction::with2(load, index_reg, src).map_err(BuildError::from)?)?;
        }
        Ok(())
    }

    /// The call probes jump through a register (or memory slot) holding
    /// the address of an intra-probe `ret` trampoline.
    fn setup_call_target(&mut self) -> Result<(), ProbeError> {
        let target = self.arch().call_target();
        let tramp = self.tramp_label();
        self.a.load_label_address(target, tramp)?;

        if self.req.spec.get(0).is_mem() {
            // Seed every slot the rotation will read through.
            let mov = match self.arch() {
                Arch::X86 => Code::Mov_rm32_r32,
                Arch::X64 => Code::Mov_rm64_r64,
            };
            let mut offsets: Vec<u32> = self
                .ops
                .instances
                .iter()
                .filter_map(|inst| match inst[0] {
                    ConcOp::Mem { offset } => Some(offset),
                    _ => None,
                })
                .collect();
            offsets.sort_unstable();
            offsets.dedup();
            for off in offsets {
                self.emit(
                    Instruction::with2(mov, self.mem_sp(i64::from(off)), target)
                        .map_err(BuildError::from)?,
                )?;
            }
        }
        Ok(())
    }

    fn tramp_label(&mut self) -> Label {
        if self.tramp.is_none() {
            self.tramp = Some(self.a.new_label());
        }
        self.tramp.unwrap()
    }

    fn body(&mut self) -> Result<(), ProbeError> {
        let arch = self.arch();
        let name = self.req.name;
        let l_body = self.a.new_label();
        let l_end = self.a.new_label();

        self.emit(
            Instruction::with2(Code::Test_rm32_r32, Register::EBP, Register::EBP)
                .map_err(BuildError::from)?,
        )?;
        self.branch(je_code(arch), l_end)?;
        self.a.align(64);
        self.a.bind(l_body);

        // Pre-loop adjustments.
        let is_stack_op = matches!(name, "push" | "pop");
        let stack_total = self.stack_op_size() * self.req.unroll;
        if is_stack_op && (name == "pop" || !self.req.with_inst) {
            self.adjust_sp(-(stack_total as i64))?;
        }
        if matches!(name, "bt" | "btc" | "btr" | "bts") {
            // RDTSC trashed EAX/EDX before the loop; bit indices must
            // stay small or memory forms walk out of the scratch area.
            self.reinit_bit_test_regs()?;
        }
        if matches!(name, "div" | "idiv" | "mul") || (name == "imul" && self.req.spec.count() == 1) {
            self.mov_imm32(Register::EAX, self.dividend())?;
        }

        for i in 0..self.req.unroll as usize {
            self.instance(i)?;
        }

        // Post-loop adjustments.
        if is_stack_op && (name == "push" || !self.req.with_inst) {
            self.adjust_sp(stack_total as i64)?;
        }

        self.emit(
            Instruction::with2(Code::Sub_rm32_imm8, Register::EBP, 1).map_err(BuildError::from)?,
        )?;
        self.branch(jne_code(arch), l_body)?;
        self.a.bind(l_end);

        if let Some(tramp) = self.tramp {
            let over = self.a.new_label();
            self.branch(jmp_code(arch), over)?;
            self.a.bind(tramp);
            let ret = match arch {
                Arch::X86 => Code::Retnd,
                Arch::X64 => Code::Retnq,
            };
            self.emit(Instruction::with(ret))?;
            self.a.bind(over);
        }
        Ok(())
    }

    /// One unrolled slot: per-instance helpers, the instruction itself
    /// (skipped in the twin), and the dependency consumer.
    fn instance(&mut self, i: usize) -> Result<(), ProbeError> {
        let arch = self.arch();
        let name = self.req.name;
        let spec = self.req.spec;
        let ops = self.ops.instances[i].clone();
        let eight_bit = matches!(spec.get(0).reg_class(), Some(RegClass::Gp8))
            || spec.get(0).mem_size() == 1;

        // Divider state: clear the high half, and in parallel mode
        // reseed the dividend so instances stay independent.
        if matches!(name, "div" | "idiv") {
            if !eight_bit {
                self.emit(
                    Instruction::with2(Code::Xor_r32_rm32, Register::EDX, Register::EDX)
                        .map_err(BuildError::from)?,
                )?;
            }
            if self.req.mode == ChainMode::Parallel {
                self.mov_imm32(Register::EAX, self.dividend())?;
            }
        }
        if (matches!(name, "mul") || (name == "imul" && spec.count() == 1))
            && self.req.mode == ChainMode::Parallel
        {
            self.mov_imm32(Register::EAX, self.dividend())?;
        }

        let evex = self.req.code.op_code().encoding() == EncodingKind::EVEX;
        if spec.iter().any(|k| k.is_vm()) {
            if evex {
                // EVEX forms consume the opmask; reload all-ones.
                self.emit(
                    Instruction::with3(
                        Code::VEX_Kxnorw_kr_kr_kr,
                        Register::K7,
                        Register::K7,
                        Register::K7,
                    )
                    .map_err(BuildError::from)?,
                )?;
            } else if self.is_gather() {
                // VEX gathers clear their mask operand; reload all-ones.
                let mask_slot = spec.count() - 1;
                if let ConcOp::Reg(mask) = ops[mask_slot] {
                    let code = match spec.get(mask_slot).reg_class() {
                        Some(RegClass::Ymm) => Code::VEX_Vpcmpeqb_ymm_ymm_ymmm256,
                        _ => Code::VEX_Vpcmpeqb_xmm_xmm_xmmm128,
                    };
                    self.emit(
                        Instruction::with3(code, mask, mask, mask).map_err(BuildError::from)?,
                    )?;
                }
            }
        }

        if self.req.with_inst {
            match name {
                "jmp" => {
                    let next = self.a.new_label();
                    self.branch(self.req.code, next)?;
                    self.a.bind(next);
                }
                "call" if spec.get(0) == OperandKind::Rel => {
                    let tramp = self.tramp_label();
                    self.branch(self.req.code, tramp)?;
                }
                "call" => {
                    let op = match ops[0] {
                        ConcOp::Mem { offset } => AsmOperand::Mem(self.mem_sp(i64::from(offset))),
                        _ => AsmOperand::Reg(arch.call_target()),
                    };
                    self.tramp_label();
                    let inst = build_instruction(self.req.code, &[op])?;
                    self.emit(inst)?;
                }
                "lea" => {
                    let inst = self.build_lea(&ops)?;
                    self.emit(inst)?;
                }
                _ => {
                    let mut asm_ops = Vec::with_capacity(ops.len());
                    for op in &ops {
                        asm_ops.push(self.conv_op(*op)?);
                    }
                    let mut inst = build_instruction(self.req.code, &asm_ops)?;
                    if db::needs_evex_mask(self.req.code, &spec) {
                        inst.set_op_mask(Register::K7);
                    }
                    self.emit(inst)?;
                }
            }
        }

        // Scatter latency: read the last scattered cell back and fold a
        // zero derived from it into the base register, so the next
        // scatter's address depends on this scatter's store.
        if self.is_scatter() && self.req.mode == ChainMode::Serial {
            self.emit_scatter_readback()?;
        }

        // Write-only destinations: park the result so a serial chain
        // actually runs through the instruction.
        if self.req.mode == ChainMode::Serial {
            if let Some((park, class)) = self.ops.park {
                self.emit_consumer(park, class, ops[0])?;
                self.dep_consumers += 1;
            }
        }
        Ok(())
    }

    fn dividend(&self) -> i32 {
        let op = self.req.spec.get(0);
        if matches!(op.reg_class(), Some(RegClass::Gp8)) || op.mem_size() == 1 {
            // AX/divisor must fit in AL.
            0xFF
        } else if matches!(op.reg_class(), Some(RegClass::Gp16)) || op.mem_size() == 2 {
            0x0303
        } else {
            0x0303_0303
        }
    }

    fn reinit_bit_test_regs(&mut self) -> Result<(), ProbeError> {
        let inits = [
            (Register::EAX, 1),
            (Register::EBX, 2),
            (Register::ECX, 3),
            (Register::EDX, 4),
            (Register::ESI, 5),
            (Register::EDI, 6),
        ];
        for (r, v) in inits {
            self.mov_imm32(r, v)?;
        }
        if self.arch() == Arch::X64 {
            let high = [
                (Register::R8D, 7),
                (Register::R9D, 8),
                (Register::R10D, 9),
                (Register::R11D, 10),
                (Register::R12D, 11),
                (Register::R13D, 12),
                (Register::R14D, 13),
                (Register::R15D, 14),
            ];
            for (r, v) in high {
                self.mov_imm32(r, v)?;
            }
        }
        Ok(())
    }

    fn adjust_sp(&mut self, delta: i64) -> Result<(), ProbeError> {
        let (sub, add) = match self.arch() {
            Arch::X86 => (Code::Sub_rm32_imm32, Code::Add_rm32_imm32),
            Arch::X64 => (Code::Sub_rm64_imm32, Code::Add_rm64_imm32),
        };
        let inst = if delta < 0 {
            Instruction::with2(sub, self.sp(), (-delta) as i32).map_err(BuildError::from)?
        } else {
            Instruction::with2(add, self.sp(), delta as i32).map_err(BuildError::from)?
        };
        self.emit(inst)
    }

    fn emit_scatter_readback(&mut self) -> Result<(), ProbeError> {
        let arch = self.arch();
        let index_bits = db::scatter_index_bits(self.req.name);
        let lane_bytes = index_bits / 8;
        let vm = self.req.spec.iter().find(|k| k.is_vm()).unwrap();
        let vec_bytes = match vm.vm_index_class().unwrap() {
            RegClass::Xmm => 16,
            RegClass::Ymm => 32,
            _ => 64,
        };
        let last_index = (vec_bytes / lane_bytes - 1) * 4;
        let last_off = i64::from(last_index * self.vsib_scale());

        let base = arch.arena_base();
        let cell = MemoryOperand::new(base, Register::None, 1, last_off, 4, false, Register::None);
        self.emit(Instruction::with2(Code::Mov_r32_rm32, Register::EAX, cell).map_err(BuildError::from)?)?;
        self.emit(
            Instruction::with2(Code::And_rm32_imm8, Register::EAX, 0).map_err(BuildError::from)?,
        )?;
        match arch {
            Arch::X64 => self.emit(
                Instruction::with2(Code::Add_r64_rm64, base, Register::RAX)
                    .map_err(BuildError::from)?,
            )?,
            Arch::X86 => self.emit(
                Instruction::with2(Code::Add_r32_rm32, base, Register::EAX)
                    .map_err(BuildError::from)?,
            )?,
        }
        Ok(())
    }

    fn emit_consumer(
        &mut self,
        park: Register,
        class: RegClass,
        dest: ConcOp,
    ) -> Result<(), ProbeError> {
        let dest_op = self.conv_op(dest)?;
        let encoding = self.req.code.op_code().encoding();
        let inst = match class {
            RegClass::Gp8 => two_op(Code::Add_r8_rm8, park, dest_op)?,
            RegClass::Gp16 => two_op(Code::Add_r16_rm16, park, dest_op)?,
            RegClass::Gp32 => two_op(Code::Add_r32_rm32, park, dest_op)?,
            RegClass::Gp64 => two_op(Code::Add_r64_rm64, park, dest_op)?,
            RegClass::Mm => two_op(Code::Paddb_mm_mmm64, park, dest_op)?,
            RegClass::K => three_op(Code::VEX_Korw_kr_kr_kr, park, dest_op)?,
            RegClass::Xmm => match encoding {
                EncodingKind::EVEX => three_op(Code::EVEX_Vpaddd_xmm_k1z_xmm_xmmm128b32, park, dest_op)?,
                EncodingKind::Legacy => two_op(Code::Paddb_xmm_xmmm128, park, dest_op)?,
                _ => three_op(Code::VEX_Vpaddb_xmm_xmm_xmmm128, park, dest_op)?,
            },
            RegClass::Ymm => match encoding {
                EncodingKind::EVEX => three_op(Code::EVEX_Vpaddd_ymm_k1z_ymm_ymmm256b32, park, dest_op)?,
                _ => three_op(Code::VEX_Vpaddb_ymm_ymm_ymmm256, park, dest_op)?,
            },
            RegClass::Zmm => three_op(Code::EVEX_Vpaddd_zmm_k1z_zmm_zmmm512b32, park, dest_op)?,
        };
        self.emit(inst)
    }

    /// Builds an LEA whose memory operand comes from the shape's base,
    /// optional index and optional displacement slots.
    fn build_lea(&mut self, ops: &[ConcOp]) -> Result<Instruction, ProbeError> {
        let dst = match ops[0] {
            ConcOp::Reg(r) => r,
            _ => return Err(BuildError::Unsupported.into()),
        };
        let base = match ops[1] {
            ConcOp::Reg(r) => r,
            _ => return Err(BuildError::Unsupported.into()),
        };
        let mut index = Register::None;
        let mut displ = 0i64;
        let mut displ_size = 0;
        for op in &ops[2..] {
            match op {
                ConcOp::Reg(r) => index = *r,
                ConcOp::Imm(v) => {
                    displ = *v;
                    displ_size = if *v >= -128 && *v <= 127 { 1 } else { 4 };
                }
                _ => return Err(BuildError::Unsupported.into()),
            }
        }
        let scale = if self.req.spec.flags.contains(crate::inst_spec::SpecFlags::LEA_SCALE) {
            8
        } else {
            1
        };
        let mem = MemoryOperand::new(base, index, scale, displ, displ_size, false, Register::None);
        Ok(Instruction::with2(self.req.code, dst, mem).map_err(BuildError::from)?)
    }

    /// Post-window cleanup: leave the FP/SIMD state the way the caller
    /// expects it.
    fn after_body(&mut self) -> Result<(), ProbeError> {
        let uses_mm = self
            .req
            .spec
            .iter()
            .any(|k| k.reg_class() == Some(RegClass::Mm));
        if uses_mm {
            self.emit(Instruction::with(Code::Emms))?;
        }
        let encoding = self.req.code.op_code().encoding();
        if matches!(encoding, EncodingKind::VEX | EncodingKind::EVEX | EncodingKind::XOP)
            && self.req.name != "vzeroupper"
            && self.req.name != "vzeroall"
        {
            self.emit(Instruction::with(Code::VEX_Vzeroupper))?;
        }
        Ok(())
    }
}

fn two_op(code: Code, park: Register, dest: AsmOperand) -> Result<Instruction, ProbeError> {
    Ok(build_instruction(code, &[AsmOperand::Reg(park), dest])?)
}

fn three_op(code: Code, park: Register, dest: AsmOperand) -> Result<Instruction, ProbeError> {
    Ok(build_instruction(
        code,
        &[AsmOperand::Reg(park), AsmOperand::Reg(park), dest],
    )?)
}

fn je_code(arch: Arch) -> Code {
    match arch {
        Arch::X86 => Code::Je_rel32_32,
        Arch::X64 => Code::Je_rel32_64,
    }
}

fn jne_code(arch: Arch) -> Code {
    match arch {
        Arch::X86 => Code::Jne_rel32_32,
        Arch::X64 => Code::Jne_rel32_64,
    }
}

fn jmp_code(arch: Arch) -> Code {
    match arch {
        Arch::X86 => Code::Jmp_rel32_32,
        Arch::X64 => Code::Jmp_rel32_64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    use crate::harness::{ChainMode, MemAlign, PARALLEL_WIDTH, UNROLL};
    use crate::inst_spec::SpecFlags;
    use crate::materialize::materialize;

    fn assemble(
        name: &str,
        code: Code,
        spec: InstSpec,
        mode: ChainMode,
        with_inst: bool,
        need_park: bool,
    ) -> ProbeCode {
        let ops = materialize(
            &spec,
            name,
            Arch::X64,
            mode,
            MemAlign::Aligned,
            need_park,
            UNROLL as usize,
            PARALLEL_WIDTH,
        );
        let req = ProbeRequest {
            code,
            name,
            spec,
            mode,
            align: MemAlign::Aligned,
            with_inst,
            unroll: UNROLL,
            rdtscp: false,
        };
        assemble_probe(&req, &ops, None, Arch::X64).unwrap()
    }

    fn decode(bytes: &[u8]) -> Vec<Instruction> {
        let mut decoder = Decoder::with_ip(64, bytes, 0, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            out.push(decoder.decode());
        }
        out
    }

    fn count_mnemonic(insts: &[Instruction], m: Mnemonic) -> usize {
        insts.iter().filter(|i| i.mnemonic() == m).count()
    }

    #[test]
    fn zero_operand_probe_brackets_with_the_tsc() {
        let probe = assemble(
            "lfence",
            Code::Lfence,
            InstSpec::new(&[]),
            ChainMode::Serial,
            true,
            false,
        );
        let insts = decode(&probe.code.bytes);
        // Start and end sample without RDTSCP, plus the measured
        // lfence instances and the start fence.
        assert_eq!(count_mnemonic(&insts, Mnemonic::Rdtsc), 2);
        assert_eq!(count_mnemonic(&insts, Mnemonic::Mfence), 1);
        assert!(count_mnemonic(&insts, Mnemonic::Lfence) >= UNROLL as usize + 2);
        assert_eq!(count_mnemonic(&insts, Mnemonic::Ret), 1);
        assert!(insts.iter().all(|i| i.code() != Code::INVALID));
    }

    #[test]
    fn overhead_twin_omits_only_the_instruction() {
        let spec = InstSpec::new(&[OperandKind::R32, OperandKind::R32]);
        let real = assemble("add", Code::Add_r32_rm32, spec, ChainMode::Serial, true, false);
        let twin = assemble("add", Code::Add_r32_rm32, spec, ChainMode::Serial, false, false);
        let real_adds = count_mnemonic(&decode(&real.code.bytes), Mnemonic::Add);
        let twin_adds = count_mnemonic(&decode(&twin.code.bytes), Mnemonic::Add);
        assert_eq!(real_adds - twin_adds, UNROLL as usize);
    }

    #[test]
    fn serial_pop_gets_a_dependency_consumer_per_slot() {
        let spec = InstSpec::new(&[OperandKind::R64]);
        let serial = assemble("pop", Code::Pop_r64, spec, ChainMode::Serial, true, true);
        assert_eq!(serial.dep_consumers, UNROLL);

        let insts = decode(&serial.code.bytes);
        assert_eq!(count_mnemonic(&insts, Mnemonic::Pop), UNROLL as usize + 6);
        // One consumer add per pop.
        assert!(count_mnemonic(&insts, Mnemonic::Add) >= UNROLL as usize);

        let parallel = assemble("pop", Code::Pop_r64, spec, ChainMode::Parallel, true, false);
        assert_eq!(parallel.dep_consumers, 0);
    }

    #[test]
    fn stack_ops_balance_the_stack_pointer() {
        let spec = InstSpec::new(&[OperandKind::R64]);
        for (with_inst, mode) in [(true, ChainMode::Serial), (false, ChainMode::Serial)] {
            let probe = assemble("push", Code::Push_r64, spec, mode, with_inst, false);
            let insts = decode(&probe.code.bytes);
            // The loop compensation must appear: an `add rsp, imm`.
            let compensates = insts.iter().any(|i| {
                i.mnemonic() == Mnemonic::Add
                    && i.op0_register() == Register::RSP
                    && i.immediate32() == UNROLL * 8
            });
            assert!(compensates, "missing stack compensation (with_inst={with_inst})");
        }
    }

    #[test]
    fn divider_probes_clear_the_high_half_before_each_instance() {
        let spec = InstSpec::new(&[OperandKind::R32]);
        let probe = assemble("div", Code::Div_rm32, spec, ChainMode::Serial, true, false);
        let insts = decode(&probe.code.bytes);
        assert_eq!(count_mnemonic(&insts, Mnemonic::Div), UNROLL as usize);
        assert!(count_mnemonic(&insts, Mnemonic::Xor) >= UNROLL as usize);
    }

    #[test]
    fn scaled_lea_probe_uses_shift_three() {
        let spec = InstSpec::with_flags(
            &[OperandKind::R64, OperandKind::R64, OperandKind::R64],
            SpecFlags::LEA_SCALE,
        );
        let probe = assemble("lea", Code::Lea_r64_m, spec, ChainMode::Serial, true, false);
        let insts = decode(&probe.code.bytes);
        let leas: Vec<_> = insts
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Lea)
            .collect();
        assert_eq!(leas.len(), UNROLL as usize);
        assert!(leas.iter().all(|i| i.memory_index_scale() == 8));
    }

    #[test]
    fn call_probe_returns_through_the_trampoline() {
        let spec = InstSpec::new(&[OperandKind::Rel]);
        let probe = assemble("call", Code::Call_rel32_64, spec, ChainMode::Serial, true, false);
        let insts = decode(&probe.code.bytes);
        assert_eq!(count_mnemonic(&insts, Mnemonic::Call), UNROLL as usize);
        // The trampoline ret plus the epilogue ret.
        assert_eq!(count_mnemonic(&insts, Mnemonic::Ret), 2);
    }

    #[test]
    fn every_emitted_probe_decodes_cleanly() {
        let cases = [
            ("add", Code::Add_r32_rm32, InstSpec::new(&[OperandKind::R32, OperandKind::R32])),
            ("shl", Code::Shl_rm64_imm8, InstSpec::new(&[OperandKind::R64, OperandKind::I8])),
            ("mov", Code::Mov_r32_rm32, InstSpec::new(&[OperandKind::R32, OperandKind::M32])),
        ];
        for (name, code, spec) in cases {
            for mode in [ChainMode::Serial, ChainMode::Parallel] {
                let probe = assemble(name, code, spec, mode, true, false);
                let insts = decode(&probe.code.bytes);
                assert!(
                    insts.iter().all(|i| i.code() != Code::INVALID),
                    "{name} probe contains invalid encodings"
                );
            }
        }
    }

    #[test]
    fn unaligned_memory_probe_biases_accesses() {
        let spec = InstSpec::new(&[OperandKind::Xmm, OperandKind::M128]);
        let ops = materialize(
            &spec,
            "movups",
            Arch::X64,
            ChainMode::Parallel,
            MemAlign::Unaligned,
            false,
            UNROLL as usize,
            PARALLEL_WIDTH,
        );
        let req = ProbeRequest {
            code: Code::Movups_xmm_xmmm128,
            name: "movups",
            spec,
            mode: ChainMode::Parallel,
            align: MemAlign::Unaligned,
            with_inst: true,
            unroll: UNROLL,
            rdtscp: true,
        };
        let probe = assemble_probe(&req, &ops, None, Arch::X64).unwrap();
        let insts = decode(&probe.code.bytes);
        assert_eq!(count_mnemonic(&insts, Mnemonic::Rdtscp), 1);
        let movups: Vec<_> = insts
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Movups)
            .collect();
        assert!(movups.iter().any(|i| i.memory_displacement64() % 16 == 1));
    }
}
