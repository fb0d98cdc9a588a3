//! Signature iteration.
//!
//! A database signature gives each operand slot a *set* of admissible
//! operand kinds ([`OpFlags`]). The iterator enumerates every
//! combination of one kind per slot, odometer style: the last slot
//! advances fastest, and exhausting a slot resets it and carries into
//! the slot to its left. Within a slot, kinds are visited from the
//! lowest set bit up, so the order is deterministic.

use crate::inst_spec::{InstSpec, OperandKind, MAX_OPS};

bitflags::bitflags! {
    /// One bit per operand kind a slot may take.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OpFlags: u64 {
        const REL = 1 << 0;

        const AL = 1 << 1;
        const BL = 1 << 2;
        const CL = 1 << 3;
        const DL = 1 << 4;
        const R8 = 1 << 5;

        const AX = 1 << 6;
        const BX = 1 << 7;
        const CX = 1 << 8;
        const DX = 1 << 9;
        const R16 = 1 << 10;

        const EAX = 1 << 11;
        const EBX = 1 << 12;
        const ECX = 1 << 13;
        const EDX = 1 << 14;
        const R32 = 1 << 15;

        const RAX = 1 << 16;
        const RBX = 1 << 17;
        const RCX = 1 << 18;
        const RDX = 1 << 19;
        const R64 = 1 << 20;

        const MM = 1 << 21;

        const XMM0 = 1 << 22;
        const XMM = 1 << 23;
        const YMM = 1 << 24;
        const ZMM = 1 << 25;

        const K = 1 << 26;

        const I8 = 1 << 27;
        const I16 = 1 << 28;
        const I32 = 1 << 29;
        const I64 = 1 << 30;

        const M8 = 1 << 31;
        const M16 = 1 << 32;
        const M32 = 1 << 33;
        const M64 = 1 << 34;
        const M128 = 1 << 35;
        const M256 = 1 << 36;
        const M512 = 1 << 37;

        const VM32X = 1 << 38;
        const VM32Y = 1 << 39;
        const VM32Z = 1 << 40;
        const VM64X = 1 << 41;
        const VM64Y = 1 << 42;
        const VM64Z = 1 << 43;
    }
}

/// Bit-index → operand kind, in bit order.
const BIT_KINDS: [OperandKind; 44] = [
    OperandKind::Rel,
    OperandKind::Al,
    OperandKind::Bl,
    OperandKind::Cl,
    OperandKind::Dl,
    OperandKind::R8,
    OperandKind::Ax,
    OperandKind::Bx,
    OperandKind::Cx,
    OperandKind::Dx,
    OperandKind::R16,
    OperandKind::Eax,
    OperandKind::Ebx,
    OperandKind::Ecx,
    OperandKind::Edx,
    OperandKind::R32,
    OperandKind::Rax,
    OperandKind::Rbx,
    OperandKind::Rcx,
    OperandKind::Rdx,
    OperandKind::R64,
    OperandKind::Mm,
    OperandKind::Xmm0,
    OperandKind::Xmm,
    OperandKind::Ymm,
    OperandKind::Zmm,
    OperandKind::K,
    OperandKind::I8,
    OperandKind::I16,
    OperandKind::I32,
    OperandKind::I64,
    OperandKind::M8,
    OperandKind::M16,
    OperandKind::M32,
    OperandKind::M64,
    OperandKind::M128,
    OperandKind::M256,
    OperandKind::M512,
    OperandKind::Vm32x,
    OperandKind::Vm32y,
    OperandKind::Vm32z,
    OperandKind::Vm64x,
    OperandKind::Vm64y,
    OperandKind::Vm64z,
];

impl OpFlags {
    pub fn from_kind(kind: OperandKind) -> Option<OpFlags> {
        let idx = BIT_KINDS.iter().position(|k| *k == kind)?;
        OpFlags::from_bits(1u64 << idx)
    }

    /// Kind of a single-bit flag value.
    pub fn to_kind(self) -> Option<OperandKind> {
        let bits = self.bits();
        if bits == 0 || !bits.is_power_of_two() {
            return None;
        }
        BIT_KINDS.get(bits.trailing_zeros() as usize).copied()
    }

    fn lowest_bit(self) -> OpFlags {
        let bits = self.bits();
        OpFlags::from_bits_truncate(bits & bits.wrapping_neg())
    }

    /// All kinds the driver is willing to test by default.
    pub fn default_filter() -> OpFlags {
        OpFlags::all()
    }
}

/// Odometer over one database signature.
pub struct SigIter {
    slots: [OpFlags; MAX_OPS],
    current: [OpFlags; MAX_OPS],
    op_count: usize,
    state: IterState,
}

enum IterState {
    Fresh,
    Running,
    Done,
}

impl SigIter {
    /// `slots` holds the per-slot kind sets; `filter` restricts every
    /// slot. A slot left empty by the filter makes the signature yield
    /// nothing (its operand cannot be materialized at all).
    pub fn new(slots: &[OpFlags], filter: OpFlags) -> SigIter {
        debug_assert!(slots.len() <= MAX_OPS);
        let op_count = slots.len();

        let mut masked = [OpFlags::empty(); MAX_OPS];
        let mut current = [OpFlags::empty(); MAX_OPS];
        let mut valid = true;
        for (i, slot) in slots.iter().enumerate() {
            masked[i] = *slot & filter;
            current[i] = masked[i].lowest_bit();
            if masked[i].is_empty() {
                valid = false;
            }
        }

        SigIter {
            slots: masked,
            current,
            op_count,
            state: if valid { IterState::Fresh } else { IterState::Done },
        }
    }

    fn spec(&self) -> InstSpec {
        let mut spec = InstSpec::default();
        for i in 0..self.op_count {
            // current[i] is single-bit by construction.
            spec.set(i, self.current[i].to_kind().unwrap());
        }
        spec
    }

    /// Advances the odometer. Returns false once all combinations have
    /// been produced.
    fn advance(&mut self) -> bool {
        let mut i = self.op_count;
        loop {
            if i == 0 {
                return false;
            }
            i -= 1;

            let prev = self.current[i].bits();
            let all = self.slots[i].bits();
            // Clear the previous bit and everything below it; the next
            // kind of this slot is the lowest remaining bit.
            let remaining = all & !(prev | prev.wrapping_sub(1));
            if remaining != 0 {
                self.current[i] = OpFlags::from_bits_truncate(remaining).lowest_bit();
                return true;
            }
            self.current[i] = self.slots[i].lowest_bit();
        }
    }
}

impl Iterator for SigIter {
    type Item = InstSpec;

    fn next(&mut self) -> Option<InstSpec> {
        match self.state {
            IterState::Fresh => {
                self.state = IterState::Running;
                Some(self.spec())
            }
            IterState::Running => {
                if self.op_count == 0 || !self.advance() {
                    self.state = IterState::Done;
                    None
                } else {
                    Some(self.spec())
                }
            }
            IterState::Done => None,
        }
    }
}
