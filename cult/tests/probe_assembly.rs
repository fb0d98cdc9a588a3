//! Assembles probes for a spread of instruction classes and checks the
//! emitted code without executing it, so these tests run anywhere the
//! encoder does.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic};

use cult::arena::Arena;
use cult::db::InstDb;
use cult::harness::{ChainMode, MemAlign, PARALLEL_WIDTH, UNROLL};
use cult::inst_spec::{InstSpec, OperandKind};
use cult::materialize::materialize;
use cult::probe::{assemble_probe, ProbeCode, ProbeRequest};
use cult::regs::Arch;
use cult::sig_iter::{OpFlags, SigIter};

fn find_code(db: &InstDb, name: &str, spec: &InstSpec) -> Code {
    let group = db.find(name).unwrap_or_else(|| panic!("{name} in database"));
    group
        .codes
        .iter()
        .copied()
        .find(|code| {
            db.signature_slots(*code)
                .map(|slots| SigIter::new(&slots, OpFlags::default_filter()).any(|s| s == *spec))
                .unwrap_or(false)
        })
        .unwrap_or_else(|| panic!("{name} signature for {spec:?}"))
}

fn assemble(
    db: &InstDb,
    name: &str,
    spec: InstSpec,
    mode: ChainMode,
    arena: Option<&Arena>,
    with_inst: bool,
    need_park: bool,
) -> ProbeCode {
    let code = find_code(db, name, &spec);
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
        rdtscp: true,
    };
    assemble_probe(&req, &ops, arena, Arch::X64).expect("probe assembles")
}

fn decode(probe: &ProbeCode) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, &probe.code.bytes, 0, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        out.push(decoder.decode());
    }
    assert!(
        out.iter().all(|i| i.code() != Code::INVALID),
        "probe contains invalid encodings"
    );
    out
}

fn count(insts: &[Instruction], m: Mnemonic) -> usize {
    insts.iter().filter(|i| i.mnemonic() == m).count()
}

#[test]
fn vex_gather_probe_reloads_its_mask_every_instance() {
    let db = InstDb::new(Arch::X64);
    let arena = Arena::new();
    let spec = InstSpec::new(&[OperandKind::Xmm, OperandKind::Vm32x, OperandKind::Xmm]);
    let probe = assemble(&db, "vpgatherdd", spec, ChainMode::Serial, Some(&arena), true, false);
    let insts = decode(&probe);

    assert_eq!(count(&insts, Mnemonic::Vpgatherdd), UNROLL as usize);
    // One all-ones mask reload per gather.
    assert!(count(&insts, Mnemonic::Vpcmpeqb) >= UNROLL as usize);
    // AVX probes end with vzeroupper.
    assert_eq!(count(&insts, Mnemonic::Vzeroupper), 1);
}

#[test]
fn evex_gather_probe_uses_the_k7_opmask() {
    let db = InstDb::new(Arch::X64);
    let arena = Arena::new();
    let spec = InstSpec::new(&[OperandKind::Zmm, OperandKind::Vm32z]);
    let probe = assemble(&db, "vpgatherdd", spec, ChainMode::Serial, Some(&arena), true, false);
    let insts = decode(&probe);

    let gathers: Vec<_> = insts
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Vpgatherdd)
        .collect();
    assert_eq!(gathers.len(), UNROLL as usize);
    assert!(gathers.iter().all(|i| i.op_mask() == iced_x86::Register::K7));
    assert_eq!(count(&insts, Mnemonic::Kxnorw), UNROLL as usize);
}

#[test]
fn serial_scatter_probe_reads_back_the_last_cell() {
    let db = InstDb::new(Arch::X64);
    let arena = Arena::new();
    let spec = InstSpec::new(&[OperandKind::Vm32z, OperandKind::Zmm]);
    let probe = assemble(&db, "vpscatterdd", spec, ChainMode::Serial, Some(&arena), true, false);
    let insts = decode(&probe);

    assert_eq!(count(&insts, Mnemonic::Vpscatterdd), UNROLL as usize);
    // The dependency-forming readback: a load and an `and reg, 0` per
    // scatter.
    assert!(count(&insts, Mnemonic::And) >= UNROLL as usize);
    assert_eq!(count(&insts, Mnemonic::Kxnorw), UNROLL as usize);

    let parallel = assemble(&db, "vpscatterdd", spec, ChainMode::Parallel, Some(&arena), true, false);
    let insts = decode(&parallel);
    assert!(count(&insts, Mnemonic::And) < UNROLL as usize);
}

#[test]
fn mmx_probe_cleans_up_with_emms() {
    let db = InstDb::new(Arch::X64);
    let spec = InstSpec::new(&[OperandKind::Mm, OperandKind::Mm]);
    let probe = assemble(&db, "paddb", spec, ChainMode::Parallel, None, true, false);
    let insts = decode(&probe);
    assert_eq!(count(&insts, Mnemonic::Emms), 1);
    assert_eq!(count(&insts, Mnemonic::Vzeroupper), 0);
}

#[test]
fn twin_probes_match_except_for_the_instruction() {
    let db = InstDb::new(Arch::X64);
    let spec = InstSpec::new(&[OperandKind::Xmm, OperandKind::Xmm]);
    for mode in [ChainMode::Serial, ChainMode::Parallel] {
        let real = assemble(&db, "paddd", spec, mode, None, true, false);
        let twin = assemble(&db, "paddd", spec, mode, None, false, false);
        let real_insts = decode(&real);
        let twin_insts = decode(&twin);
        assert_eq!(count(&real_insts, Mnemonic::Paddd), UNROLL as usize);
        assert_eq!(count(&twin_insts, Mnemonic::Paddd), 0);
        // Frame and loop control survive in the twin.
        assert_eq!(count(&twin_insts, Mnemonic::Rdtscp), 1);
        assert_eq!(count(&twin_insts, Mnemonic::Test), count(&real_insts, Mnemonic::Test));
    }
}

#[test]
fn wide_memory_shapes_stay_inside_the_scratch_area() {
    let db = InstDb::new(Arch::X64);
    let spec = InstSpec::new(&[OperandKind::Xmm, OperandKind::M128]);
    let probe = assemble(&db, "movups", spec, ChainMode::Parallel, None, true, false);
    let insts = decode(&probe);
    for inst in insts.iter().filter(|i| i.mnemonic() == Mnemonic::Movups) {
        let displ = inst.memory_displacement64();
        assert!(displ < 4096, "memory operand at {displ} outside scratch");
    }
}
