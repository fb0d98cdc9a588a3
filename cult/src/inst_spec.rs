//! Operand-shape descriptors.
//!
//! An [`InstSpec`] names the operand pattern of one measurable form of
//! an instruction, e.g. `{r32, r32}` or `{xmm, m128}`. It is a small
//! value type with structural equality so the driver can deduplicate
//! shapes across database signatures with a plain hash set.

/// Operand slot kinds. `Rel` is a branch displacement; fixed-register
/// kinds (Al..Rbx, Xmm0) pin the slot to one architectural register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperandKind {
    #[default]
    None,
    Rel,

    Al,
    Bl,
    Cl,
    Dl,
    R8,

    Ax,
    Bx,
    Cx,
    Dx,
    R16,

    Eax,
    Ebx,
    Ecx,
    Edx,
    R32,

    Rax,
    Rbx,
    Rcx,
    Rdx,
    R64,

    Mm,

    Xmm0,
    Xmm,
    Ymm,
    Zmm,

    K,

    I8,
    I16,
    I32,
    I64,

    M8,
    M16,
    M32,
    M64,
    M128,
    M256,
    M512,

    Vm32x,
    Vm32y,
    Vm32z,
    Vm64x,
    Vm64y,
    Vm64z,
}

/// Register class of a register-like operand kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Gp8,
    Gp16,
    Gp32,
    Gp64,
    Mm,
    Xmm,
    Ymm,
    Zmm,
    K,
}

impl OperandKind {
    /// Register class for register kinds (fixed and generic), `None`
    /// for everything else.
    pub fn reg_class(self) -> Option<RegClass> {
        use OperandKind::*;
        Some(match self {
            Al | Bl | Cl | Dl | R8 => RegClass::Gp8,
            Ax | Bx | Cx | Dx | R16 => RegClass::Gp16,
            Eax | Ebx | Ecx | Edx | R32 => RegClass::Gp32,
            Rax | Rbx | Rcx | Rdx | R64 => RegClass::Gp64,
            Mm => RegClass::Mm,
            Xmm0 | Xmm => RegClass::Xmm,
            Ymm => RegClass::Ymm,
            Zmm => RegClass::Zmm,
            K => RegClass::K,
            _ => return Option::None,
        })
    }

    /// Fixed-register kinds always bind the same architectural register.
    pub fn fixed_reg_id(self) -> Option<u32> {
        use OperandKind::*;
        Some(match self {
            Al | Ax | Eax | Rax | Xmm0 => 0,
            Cl | Cx | Ecx | Rcx => 1,
            Dl | Dx | Edx | Rdx => 2,
            Bl | Bx | Ebx | Rbx => 3,
            _ => return Option::None,
        })
    }

    pub fn is_reg(self) -> bool {
        self.reg_class().is_some()
    }

    pub fn is_imm(self) -> bool {
        matches!(
            self,
            OperandKind::I8 | OperandKind::I16 | OperandKind::I32 | OperandKind::I64
        )
    }

    pub fn is_mem(self) -> bool {
        use OperandKind::*;
        matches!(self, M8 | M16 | M32 | M64 | M128 | M256 | M512)
    }

    pub fn is_vm(self) -> bool {
        use OperandKind::*;
        matches!(self, Vm32x | Vm32y | Vm32z | Vm64x | Vm64y | Vm64z)
    }

    /// Size in bytes of a memory kind.
    pub fn mem_size(self) -> u32 {
        use OperandKind::*;
        match self {
            M8 => 1,
            M16 => 2,
            M32 => 4,
            M64 => 8,
            M128 => 16,
            M256 => 32,
            M512 => 64,
            _ => 0,
        }
    }

    /// Vector class carrying the indices of a vector-index memory kind.
    pub fn vm_index_class(self) -> Option<RegClass> {
        use OperandKind::*;
        Some(match self {
            Vm32x | Vm64x => RegClass::Xmm,
            Vm32y | Vm64y => RegClass::Ymm,
            Vm32z | Vm64z => RegClass::Zmm,
            _ => return Option::None,
        })
    }

    /// Index element width in bits of a vector-index memory kind.
    pub fn vm_index_bits(self) -> u32 {
        use OperandKind::*;
        match self {
            Vm32x | Vm32y | Vm32z => 32,
            Vm64x | Vm64y | Vm64z => 64,
            _ => 0,
        }
    }

    /// Name used in report strings, `"r32"`/`"m128"`/`"vm32x"` style.
    pub fn name(self) -> &'static str {
        use OperandKind::*;
        match self {
            None => "none",
            Rel => "rel",
            Al => "al",
            Bl => "bl",
            Cl => "cl",
            Dl => "dl",
            R8 => "r8",
            Ax => "ax",
            Bx => "bx",
            Cx => "cx",
            Dx => "dx",
            R16 => "r16",
            Eax => "eax",
            Ebx => "ebx",
            Ecx => "ecx",
            Edx => "edx",
            R32 => "r32",
            Rax => "rax",
            Rbx => "rbx",
            Rcx => "rcx",
            Rdx => "rdx",
            R64 => "r64",
            Mm => "mm",
            Xmm0 => "xmm0",
            Xmm => "xmm",
            Ymm => "ymm",
            Zmm => "zmm",
            K => "k",
            I8 => "i8",
            I16 => "i16",
            I32 => "i32",
            I64 => "i64",
            M8 => "m8",
            M16 => "m16",
            M32 => "m32",
            M64 => "m64",
            M128 => "m128",
            M256 => "m256",
            M512 => "m512",
            Vm32x => "vm32x",
            Vm32y => "vm32y",
            Vm32z => "vm32z",
            Vm64x => "vm64x",
            Vm64y => "vm64y",
            Vm64z => "vm64z",
        }
    }
}

pub const MAX_OPS: usize = 6;

bitflags::bitflags! {
    /// Shape-level modifiers that are not expressible as operand kinds.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct SpecFlags: u8 {
        /// LEA form with a scaled index (`[base + index * 8]`).
        const LEA_SCALE = 0x01;
    }
}

/// Fixed-arity operand-shape descriptor. Slots after the first `None`
/// are `None`; the all-`None` descriptor is the zero-operand shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InstSpec {
    ops: [OperandKind; MAX_OPS],
    pub flags: SpecFlags,
}

impl InstSpec {
    pub fn new(kinds: &[OperandKind]) -> InstSpec {
        debug_assert!(kinds.len() <= MAX_OPS);
        let mut ops = [OperandKind::None; MAX_OPS];
        ops[..kinds.len()].copy_from_slice(kinds);
        InstSpec {
            ops,
            flags: SpecFlags::empty(),
        }
    }

    pub fn with_flags(kinds: &[OperandKind], flags: SpecFlags) -> InstSpec {
        let mut spec = InstSpec::new(kinds);
        spec.flags = flags;
        spec
    }

    pub fn get(&self, i: usize) -> OperandKind {
        self.ops[i]
    }

    pub fn set(&mut self, i: usize, kind: OperandKind) {
        self.ops[i] = kind;
    }

    /// Number of operands: index of the first `None` slot.
    pub fn count(&self) -> usize {
        self.ops
            .iter()
            .position(|k| *k == OperandKind::None)
            .unwrap_or(MAX_OPS)
    }

    pub fn is_empty(&self) -> bool {
        self.ops[0] == OperandKind::None
    }

    pub fn iter(&self) -> impl Iterator<Item = OperandKind> + '_ {
        self.ops.iter().copied().take(self.count())
    }

    /// The single memory or vector-index-memory kind, if any slot has one.
    pub fn mem_op(&self) -> Option<OperandKind> {
        self.iter().find(|k| k.is_mem() || k.is_vm())
    }

    /// Slot index of the memory/vm operand.
    pub fn mem_slot(&self) -> Option<usize> {
        self.iter().position(|k| k.is_mem() || k.is_vm())
    }

    /// Implicit operands are encoded by the opcode itself rather than a
    /// register field: the fixed GP kinds and XMM0.
    pub fn is_implicit_op(kind: OperandKind) -> bool {
        kind.fixed_reg_id().is_some()
    }

    /// Whether any slot uses a vector or mask register, or vector-index
    /// memory. Vector shapes are always safe to probe in user mode.
    pub fn uses_vector_regs(&self) -> bool {
        self.iter().any(|k| {
            matches!(
                k.reg_class(),
                Some(RegClass::Mm | RegClass::Xmm | RegClass::Ymm | RegClass::Zmm | RegClass::K)
            ) || k.is_vm()
        })
    }
}
