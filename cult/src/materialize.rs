//! Operand materialization: expanding a shape descriptor into the
//! concrete operands of every unrolled instance.
//!
//! Register slots rotate through a pool so that the instances form
//! either one serial dependency chain (each destination feeds the next
//! instance's source) or independent parallel chains. Memory slots are
//! stack-relative; immediates follow a small deterministic recurrence
//! so the encoder sees varied values.

use iced_x86::Register;

use crate::harness::{ChainMode, MemAlign};
use crate::inst_spec::{InstSpec, OperandKind, RegClass};
use crate::regs::{class_ids, reg, Arch, PARK_ID};

/// Bytes of probe stack reserved for memory operands. Parallel memory
/// rotation wraps inside this region.
pub const SCRATCH_BYTES: u32 = 4096;

/// A concrete operand of one unrolled instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcOp {
    Reg(Register),
    Imm(i64),
    /// Stack-relative memory, offset from the probe's scratch base.
    Mem { offset: u32 },
    /// Vector-index memory; the base is the arena register.
    VecMem { index: Register },
    /// Branch target; the emitter binds it to a probe-local label.
    Rel,
}

pub struct Materialized {
    /// `unroll` entries, each with one `ConcOp` per operand slot.
    pub instances: Vec<Vec<ConcOp>>,
    /// Parking register consuming write-only destinations, when needed.
    pub park: Option<(Register, RegClass)>,
}

/// Instructions with implicit accumulator/overflow registers; their
/// pools must not hand EAX or EDX out as explicit operands.
fn uses_implicit_ax_dx(name: &str, spec: &InstSpec) -> bool {
    match name {
        "div" | "idiv" | "mul" => true,
        "imul" => spec.count() == 1,
        _ => false,
    }
}

/// Complex FP16 multiply-accumulate forms forbid the destination from
/// aliasing any source, so their rotation steps by two.
fn is_fp_complex(name: &str) -> bool {
    name.starts_with("vf") && (name.ends_with("cph") || name.ends_with("csh"))
}

/// Per-register-slot rotation start offsets and the shared increment.
fn rotation(r: usize, mode: ChainMode, fp_complex: bool) -> (Vec<usize>, usize) {
    if fp_complex {
        let starts = match mode {
            // Destination 2i+2 feeds source 2(i+1): a chain that never
            // aliases within one instance.
            ChainMode::Serial => (0..r).map(|i| r - 1 - i).collect::<Vec<_>>(),
            ChainMode::Parallel => (0..r)
                .map(|i| if i == 0 { 0 } else { 2 * i - 1 })
                .collect(),
        };
        return (starts, 2);
    }

    match mode {
        ChainMode::Serial => match r {
            0 => (vec![], 1),
            1 => (vec![0], 0),
            2 => (vec![1, 0], 1),
            3 => (vec![1, 1, 0], 1),
            _ => {
                let mut starts = vec![0; r];
                starts[0] = 1;
                (starts, 1)
            }
        },
        ChainMode::Parallel => match r {
            0 => (vec![], 1),
            1 => (vec![0], 1),
            2 => (vec![0, 1], 1),
            3 => (vec![0, 0, 1], 1),
            _ => {
                let mut starts = vec![0; r];
                starts[0] = 2;
                starts[1] = 1;
                (starts, 1)
            }
        },
    }
}

fn fill_regs(pool: &[Register], start: usize, inc: usize, n: usize) -> Vec<Register> {
    let len = pool.len();
    let mut id = start % len;
    (0..n)
        .map(|_| {
            let r = pool[id];
            id = (id + inc) % len;
            r
        })
        .collect()
}

fn fill_imms(kind: OperandKind, n: usize) -> Vec<i64> {
    let max: i64 = match kind {
        OperandKind::I8 => 31,
        _ => 8191,
    };
    let mut v = 1i64;
    (0..n)
        .map(|_| {
            let out = v;
            v = (v + 1) % (max + 1);
            out
        })
        .collect()
}

fn fill_mems(size: u32, mode: ChainMode, align: MemAlign, n: usize) -> Vec<u32> {
    let bias = match align {
        MemAlign::Aligned => 0,
        MemAlign::Unaligned => 1,
    };
    let inc = match mode {
        ChainMode::Serial => 0,
        ChainMode::Parallel => size,
    };
    (0..n)
        .map(|i| bias + (i as u32 * inc) % SCRATCH_BYTES)
        .collect()
}

/// Materializes one descriptor into `unroll` concrete instances.
#[allow(clippy::too_many_arguments)]
pub fn materialize(
    spec: &InstSpec,
    name: &str,
    arch: Arch,
    mode: ChainMode,
    align: MemAlign,
    need_park: bool,
    unroll: usize,
    parallel_width: usize,
) -> Materialized {
    let fp_complex = is_fp_complex(name);
    let has_vm = spec.iter().any(|k| k.is_vm());

    // Architectural exclusions shared by every slot of this probe.
    let mut gp_excluded: Vec<u32> = Vec::new();
    let mut vec_excluded: Vec<u32> = Vec::new();
    for kind in spec.iter() {
        if let Some(id) = kind.fixed_reg_id() {
            if kind.reg_class() == Some(RegClass::Xmm) {
                vec_excluded.push(id);
            } else {
                gp_excluded.push(id);
            }
        }
    }
    if uses_implicit_ax_dx(name, spec) {
        gp_excluded.push(0);
        gp_excluded.push(2);
    }
    if has_vm {
        gp_excluded.push(arch.arena_base_id());
        vec_excluded.push(arch.vm_index_id());
    }
    if need_park {
        gp_excluded.push(PARK_ID);
        vec_excluded.push(PARK_ID);
    }
    if name == "call" {
        gp_excluded.push(arch.call_target_id());
    }

    let pool_for = |class: RegClass| -> Vec<Register> {
        let excluded: &[u32] = match class {
            RegClass::Gp8 | RegClass::Gp16 | RegClass::Gp32 | RegClass::Gp64 => &gp_excluded,
            _ => &vec_excluded,
        };
        let mut ids: Vec<u32> = class_ids(arch, class)
            .into_iter()
            .filter(|id| !excluded.contains(id))
            .collect();
        if mode == ChainMode::Parallel && !fp_complex && ids.len() > parallel_width {
            ids.truncate(parallel_width);
        }
        ids.into_iter().map(|id| reg(arch, class, id)).collect()
    };

    // Rotating register slots, in slot order; fixed-register slots are
    // pinned and take no part in the rotation.
    let rotating: Vec<usize> = (0..spec.count())
        .filter(|i| {
            let kind = spec.get(*i);
            kind.is_reg() && kind.fixed_reg_id().is_none()
        })
        .collect();
    let (starts, inc) = rotation(rotating.len(), mode, fp_complex);

    let mut per_slot: Vec<Vec<ConcOp>> = Vec::with_capacity(spec.count());
    let mut rot_idx = 0;
    for i in 0..spec.count() {
        let kind = spec.get(i);
        let ops: Vec<ConcOp> = if let Some(id) = kind.fixed_reg_id() {
            let r = reg(arch, kind.reg_class().unwrap(), id);
            vec![ConcOp::Reg(r); unroll]
        } else if let Some(class) = kind.reg_class() {
            let pool = pool_for(class);
            let regs = fill_regs(&pool, starts[rot_idx], inc, unroll);
            rot_idx += 1;
            regs.into_iter().map(ConcOp::Reg).collect()
        } else if kind.is_imm() {
            fill_imms(kind, unroll).into_iter().map(ConcOp::Imm).collect()
        } else if kind.is_mem() {
            fill_mems(kind.mem_size(), mode, align, unroll)
                .into_iter()
                .map(|offset| ConcOp::Mem { offset })
                .collect()
        } else if let Some(class) = kind.vm_index_class() {
            let index = reg(arch, class, arch.vm_index_id());
            vec![ConcOp::VecMem { index }; unroll]
        } else {
            vec![ConcOp::Rel; unroll]
        };
        per_slot.push(ops);
    }

    let instances = (0..unroll)
        .map(|i| per_slot.iter().map(|slot| slot[i]).collect())
        .collect();

    let park = if need_park {
        park_register(spec, arch)
    } else {
        None
    };

    Materialized { instances, park }
}

/// Parking register for a write-only destination, class-matched to the
/// destination so a plain add/paddb/korw can consume it.
fn park_register(spec: &InstSpec, arch: Arch) -> Option<(Register, RegClass)> {
    let dest = spec.get(0);
    let class = if let Some(class) = dest.reg_class() {
        class
    } else if dest.is_mem() {
        match dest.mem_size() {
            1 => RegClass::Gp8,
            2 => RegClass::Gp16,
            4 => RegClass::Gp32,
            8 => RegClass::Gp64,
            // Wide memory destinations have no cheap scalar consumer.
            _ => return None,
        }
    } else {
        return None;
    };
    Some((reg(arch, class, PARK_ID), class))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{PARALLEL_WIDTH, UNROLL};

    fn mat(spec: &InstSpec, name: &str, mode: ChainMode) -> Materialized {
        materialize(
            spec,
            name,
            Arch::X64,
            mode,
            MemAlign::Aligned,
            false,
            UNROLL as usize,
            PARALLEL_WIDTH,
        )
    }

    fn reg_of(op: ConcOp) -> Register {
        match op {
            ConcOp::Reg(r) => r,
            other => panic!("expected register, got {other:?}"),
        }
    }

    #[test]
    fn serial_two_reg_instances_form_a_chain() {
        let spec = InstSpec::new(&[OperandKind::R64, OperandKind::R64]);
        let m = mat(&spec, "add", ChainMode::Serial);
        for i in 0..m.instances.len() - 1 {
            // The destination of instance i is the source of i + 1.
            assert_eq!(reg_of(m.instances[i][0]), reg_of(m.instances[i + 1][1]));
        }
    }

    #[test]
    fn parallel_two_reg_instances_are_independent() {
        let spec = InstSpec::new(&[OperandKind::R64, OperandKind::R64]);
        let m = mat(&spec, "add", ChainMode::Parallel);
        for inst in &m.instances {
            assert_ne!(reg_of(inst[0]), reg_of(inst[1]));
        }
        // Destinations rotate with the parallel width.
        let d0 = reg_of(m.instances[0][0]);
        let dp = reg_of(m.instances[PARALLEL_WIDTH][0]);
        assert_eq!(d0, dp);
        assert_ne!(d0, reg_of(m.instances[1][0]));
    }

    #[test]
    fn serial_single_reg_repeats_one_register() {
        let spec = InstSpec::new(&[OperandKind::R32]);
        let m = mat(&spec, "inc", ChainMode::Serial);
        let first = reg_of(m.instances[0][0]);
        assert!(m.instances.iter().all(|i| reg_of(i[0]) == first));
    }

    #[test]
    fn pools_avoid_stack_counter_and_implicit_registers() {
        let spec = InstSpec::new(&[OperandKind::R64]);
        let m = mat(&spec, "div", ChainMode::Parallel);
        for inst in &m.instances {
            let r = reg_of(inst[0]);
            assert!(
                !matches!(r, Register::RSP | Register::RBP | Register::RAX | Register::RDX),
                "{r:?} must not be a div operand"
            );
        }
    }

    #[test]
    fn fixed_register_slots_are_pinned() {
        let spec = InstSpec::new(&[OperandKind::Al, OperandKind::I8]);
        let m = mat(&spec, "add", ChainMode::Serial);
        assert!(m.instances.iter().all(|i| reg_of(i[0]) == Register::AL));
    }

    #[test]
    fn serial_memory_reuses_one_address_and_parallel_spreads() {
        let spec = InstSpec::new(&[OperandKind::M64, OperandKind::R64]);
        let serial = mat(&spec, "add", ChainMode::Serial);
        assert!(serial
            .instances
            .iter()
            .all(|i| i[0] == ConcOp::Mem { offset: 0 }));

        let parallel = mat(&spec, "add", ChainMode::Parallel);
        assert_eq!(parallel.instances[1][0], ConcOp::Mem { offset: 8 });
        assert_eq!(parallel.instances[2][0], ConcOp::Mem { offset: 16 });
    }

    #[test]
    fn unaligned_memory_is_biased_by_one_byte() {
        let spec = InstSpec::new(&[OperandKind::Xmm, OperandKind::M128]);
        let m = materialize(
            &spec,
            "movups",
            Arch::X64,
            ChainMode::Parallel,
            MemAlign::Unaligned,
            false,
            UNROLL as usize,
            PARALLEL_WIDTH,
        );
        assert_eq!(m.instances[0][1], ConcOp::Mem { offset: 1 });
        assert_eq!(m.instances[1][1], ConcOp::Mem { offset: 17 });
    }

    #[test]
    fn immediates_follow_the_recurrence_within_range() {
        let spec = InstSpec::new(&[OperandKind::R64, OperandKind::I8]);
        let m = mat(&spec, "shl", ChainMode::Serial);
        for (i, inst) in m.instances.iter().enumerate().take(30) {
            assert_eq!(inst[1], ConcOp::Imm((i as i64 % 31) + 1));
        }
    }

    #[test]
    fn write_only_destination_gets_a_class_matched_park() {
        let spec = InstSpec::new(&[OperandKind::R64]);
        let m = materialize(
            &spec,
            "pop",
            Arch::X64,
            ChainMode::Serial,
            MemAlign::Aligned,
            true,
            UNROLL as usize,
            PARALLEL_WIDTH,
        );
        assert_eq!(m.park, Some((Register::RSI, RegClass::Gp64)));
        for inst in &m.instances {
            assert_ne!(reg_of(inst[0]), Register::RSI);
        }
    }

    #[test]
    fn vm_slots_bind_the_reserved_index_register() {
        let spec = InstSpec::new(&[OperandKind::Xmm, OperandKind::Vm32x, OperandKind::Xmm]);
        let m = mat(&spec, "vgatherdps", ChainMode::Serial);
        for inst in &m.instances {
            assert_eq!(inst[1], ConcOp::VecMem { index: Register::XMM15 });
            assert_ne!(reg_of(inst[0]), Register::XMM15);
            assert_ne!(reg_of(inst[2]), Register::XMM15);
        }
    }

    #[test]
    fn fp_complex_destination_never_aliases_sources() {
        let spec = InstSpec::new(&[OperandKind::Xmm, OperandKind::Xmm, OperandKind::Xmm]);
        for mode in [ChainMode::Serial, ChainMode::Parallel] {
            let m = mat(&spec, "vfmaddcph", mode);
            for inst in &m.instances {
                let dest = reg_of(inst[0]);
                assert_ne!(dest, reg_of(inst[1]));
                assert_ne!(dest, reg_of(inst[2]));
            }
        }
    }
}
