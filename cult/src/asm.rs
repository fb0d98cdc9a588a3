//! A small fixed-purpose assembler on top of [`iced_x86::Encoder`].
//!
//! Probes only need forward/backward branches to local labels, 64-byte
//! loop alignment, and (on 32-bit targets) absolute-address fixups that
//! can only be applied once the executable region's base is known. All
//! branches use rel32 forms so an unbound target can be patched in
//! place later.

use iced_x86::{Code, Encoder, IcedError, Instruction, MemoryOperand, Register};

use crate::regs::Arch;

#[derive(Debug, thiserror::Error)]
pub enum AsmError {
    #[error("encoding failed: {0}")]
    Encode(#[from] IcedError),
    #[error("label used but never bound")]
    UnboundLabel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// A rel32 patch: the four bytes ending at `end` hold a displacement
/// relative to `end`, pointing at `label`.
struct RelFixup {
    end: usize,
    label: Label,
}

/// An absolute-address patch (32-bit only): the four bytes ending at
/// `end` hold `region_base + label_offset`, filled in at load time.
#[derive(Debug, Clone, Copy)]
pub struct AbsFixup {
    pub end: usize,
    pub target_offset: usize,
}

pub struct Asm {
    arch: Arch,
    enc: Encoder,
    buf: Vec<u8>,
    labels: Vec<Option<usize>>,
    rel_fixups: Vec<RelFixup>,
    abs_fixups: Vec<(usize, Label)>,
}

impl Asm {
    pub fn new(arch: Arch) -> Asm {
        Asm {
            arch,
            enc: Encoder::new(arch.bitness()),
            buf: Vec::with_capacity(4096),
            labels: Vec::new(),
            rel_fixups: Vec::new(),
            abs_fixups: Vec::new(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    pub fn emit(&mut self, inst: Instruction) -> Result<(), AsmError> {
        let rip = self.buf.len() as u64;
        self.enc.encode(&inst, rip)?;
        let bytes = self.enc.take_buffer();
        self.buf.extend_from_slice(&bytes);
        Ok(())
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none());
        self.labels[label.0] = Some(self.buf.len());
    }

    /// Emits a rel32 branch (`code` must be a `*_rel32_*` form). An
    /// unbound target is encoded with a zero-ish displacement and
    /// patched at finalize.
    pub fn branch(&mut self, code: Code, label: Label) -> Result<(), AsmError> {
        if let Some(target) = self.labels[label.0] {
            let inst = Instruction::with_branch(code, target as u64)?;
            self.emit(inst)
        } else {
            let inst = Instruction::with_branch(code, 0)?;
            self.emit(inst)?;
            self.rel_fixups.push(RelFixup {
                end: self.buf.len(),
                label,
            });
            Ok(())
        }
    }

    /// Loads the address of `label` into `reg`: RIP-relative LEA on
    /// 64-bit, a patched `mov reg, imm32` on 32-bit.
    pub fn load_label_address(&mut self, reg: Register, label: Label) -> Result<(), AsmError> {
        match self.arch {
            Arch::X64 => {
                let mem =
                    MemoryOperand::new(Register::RIP, Register::None, 1, 0, 8, false, Register::None);
                let inst = Instruction::with2(Code::Lea_r64_m, reg, mem)?;
                self.emit(inst)?;
                self.rel_fixups.push(RelFixup {
                    end: self.buf.len(),
                    label,
                });
                Ok(())
            }
            Arch::X86 => {
                let inst = Instruction::with2(Code::Mov_r32_imm32, reg, 0)?;
                self.emit(inst)?;
                self.abs_fixups.push((self.buf.len(), label));
                Ok(())
            }
        }
    }

    /// Pads with single-byte NOPs to the given power-of-two boundary.
    pub fn align(&mut self, boundary: usize) {
        while self.buf.len() % boundary != 0 {
            self.buf.push(0x90);
        }
    }

    pub fn finalize(mut self) -> Result<AsmCode, AsmError> {
        for fixup in &self.rel_fixups {
            let target = self.labels[fixup.label.0].ok_or(AsmError::UnboundLabel)?;
            let rel = target as i64 - fixup.end as i64;
            let bytes = (rel as i32).to_le_bytes();
            self.buf[fixup.end - 4..fixup.end].copy_from_slice(&bytes);
        }

        let mut abs = Vec::with_capacity(self.abs_fixups.len());
        for (end, label) in &self.abs_fixups {
            let target = self.labels[label.0].ok_or(AsmError::UnboundLabel)?;
            abs.push(AbsFixup {
                end: *end,
                target_offset: target,
            });
        }

        Ok(AsmCode {
            bytes: self.buf,
            abs_fixups: abs,
        })
    }
}

/// Finished machine code plus the load-time patches it still needs.
pub struct AsmCode {
    pub bytes: Vec<u8>,
    pub abs_fixups: Vec<AbsFixup>,
}

impl AsmCode {
    /// Applies absolute fixups against the final base address. `buf`
    /// must be the copy of `bytes` living at `base`.
    pub fn apply_abs_fixups(&self, buf: &mut [u8], base: u64) {
        for fixup in &self.abs_fixups {
            let value = (base + fixup.target_offset as u64) as u32;
            buf[fixup.end - 4..fixup.end].copy_from_slice(&value.to_le_bytes());
        }
    }
}
