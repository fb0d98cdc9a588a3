//! Physical register tables and the probe target architecture.
//!
//! Registers are addressed by (class, id) everywhere in the
//! materializer; the tables here turn those back into `iced` registers.
//! Pool construction lives here too so every component agrees on which
//! ids are architecturally reserved.

use iced_x86::Register;

use crate::inst_spec::RegClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X64,
}

impl Arch {
    pub fn host() -> Arch {
        if cfg!(target_pointer_width = "64") {
            Arch::X64
        } else {
            Arch::X86
        }
    }

    pub fn bitness(self) -> u32 {
        match self {
            Arch::X86 => 32,
            Arch::X64 => 64,
        }
    }

    /// Number of addressable GP/vector registers.
    pub fn reg_count(self) -> usize {
        match self {
            Arch::X86 => 8,
            Arch::X64 => 16,
        }
    }

    pub fn sp(self) -> Register {
        match self {
            Arch::X86 => Register::ESP,
            Arch::X64 => Register::RSP,
        }
    }

    /// GP register holding the gather/scatter arena base. Excluded from
    /// operand pools whenever a probe uses vector-index memory.
    pub fn arena_base(self) -> Register {
        match self {
            Arch::X86 => Register::EDI,
            Arch::X64 => Register::R11,
        }
    }

    pub fn arena_base_id(self) -> u32 {
        match self {
            Arch::X86 => 7,
            Arch::X64 => 11,
        }
    }

    /// Id of the vector register holding gather/scatter indices.
    pub fn vm_index_id(self) -> u32 {
        match self {
            Arch::X86 => 7,
            Arch::X64 => 15,
        }
    }

    /// Register the intra-probe call trampoline address lives in.
    pub fn call_target(self) -> Register {
        match self {
            Arch::X86 => Register::ESI,
            Arch::X64 => Register::R14,
        }
    }

    pub fn call_target_id(self) -> u32 {
        match self {
            Arch::X86 => 6,
            Arch::X64 => 14,
        }
    }
}

const GP8_X64: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];

// Without REX, ids 4..=7 address the legacy high-byte registers.
const GP8_X86: [Register; 8] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::AH,
    Register::CH,
    Register::DH,
    Register::BH,
];

const GP16: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];

const GP32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GP64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const MM: [Register; 8] = [
    Register::MM0,
    Register::MM1,
    Register::MM2,
    Register::MM3,
    Register::MM4,
    Register::MM5,
    Register::MM6,
    Register::MM7,
];

const XMM: [Register; 16] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

const YMM: [Register; 16] = [
    Register::YMM0,
    Register::YMM1,
    Register::YMM2,
    Register::YMM3,
    Register::YMM4,
    Register::YMM5,
    Register::YMM6,
    Register::YMM7,
    Register::YMM8,
    Register::YMM9,
    Register::YMM10,
    Register::YMM11,
    Register::YMM12,
    Register::YMM13,
    Register::YMM14,
    Register::YMM15,
];

const ZMM: [Register; 16] = [
    Register::ZMM0,
    Register::ZMM1,
    Register::ZMM2,
    Register::ZMM3,
    Register::ZMM4,
    Register::ZMM5,
    Register::ZMM6,
    Register::ZMM7,
    Register::ZMM8,
    Register::ZMM9,
    Register::ZMM10,
    Register::ZMM11,
    Register::ZMM12,
    Register::ZMM13,
    Register::ZMM14,
    Register::ZMM15,
];

const KREGS: [Register; 8] = [
    Register::K0,
    Register::K1,
    Register::K2,
    Register::K3,
    Register::K4,
    Register::K5,
    Register::K6,
    Register::K7,
];

/// Physical register for a (class, id) pair.
pub fn reg(arch: Arch, class: RegClass, id: u32) -> Register {
    let id = id as usize;
    match class {
        RegClass::Gp8 => match arch {
            Arch::X86 => GP8_X86[id],
            Arch::X64 => GP8_X64[id],
        },
        RegClass::Gp16 => GP16[id],
        RegClass::Gp32 => GP32[id],
        RegClass::Gp64 => GP64[id],
        RegClass::Mm => MM[id],
        RegClass::Xmm => XMM[id],
        RegClass::Ymm => YMM[id],
        RegClass::Zmm => ZMM[id],
        RegClass::K => KREGS[id],
    }
}

/// Id reserved as the dependency-parking register for write-only
/// destinations. Valid in every class on both architectures.
pub const PARK_ID: u32 = 6;

/// Candidate ids for a class, before per-probe exclusions.
pub fn class_ids(arch: Arch, class: RegClass) -> Vec<u32> {
    match class {
        RegClass::Gp8 | RegClass::Gp16 | RegClass::Gp32 | RegClass::Gp64 => {
            // SP is the probe's stack, BP the loop counter.
            (0..arch.reg_count() as u32).filter(|id| *id != 4 && *id != 5).collect()
        }
        RegClass::Mm => (0..8).collect(),
        RegClass::Xmm | RegClass::Ymm | RegClass::Zmm => (0..arch.reg_count() as u32).collect(),
        // K0 means "no mask" in EVEX encodings; never rotate through it.
        RegClass::K => (1..8).collect(),
    }
}
