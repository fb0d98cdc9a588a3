//! Raw CPUID access and the full leaf/subleaf walk.
//!
//! The walk records every architecturally meaningful `(leaf, subleaf)`
//! output so the final report carries enough raw data to re-derive
//! anything a consumer might want (cache topology, feature words,
//! frequency leaves) without re-running on the same machine.

use serde::ser::Serializer;
use serde_derive::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidOut {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidOut {
    /// The CPU returns all zeros for invalid leaf/subleaf combinations.
    pub fn is_valid(&self) -> bool {
        (self.eax | self.ebx | self.ecx | self.edx) != 0
    }
}

/// Executes CPUID with the given leaf in EAX and subleaf in ECX.
pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidOut {
    #[cfg(target_arch = "x86_64")]
    let r = unsafe { std::arch::x86_64::__cpuid_count(leaf, subleaf) };
    #[cfg(target_arch = "x86")]
    let r = unsafe { std::arch::x86::__cpuid_count(leaf, subleaf) };
    CpuidOut {
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    }
}

/// Reads an extended control register (XGETBV). Only valid when the
/// OSXSAVE feature bit is set; callers must check first.
pub fn xgetbv(xcr: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        std::arch::asm!(
            "xgetbv",
            in("ecx") xcr,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags),
        );
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

fn hex8<S: Serializer>(v: &u32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{v:08X}"))
}

/// One recorded CPUID invocation, serialized with fixed-width hex so the
/// JSON matches what the usual cpuid dump tools print.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CpuidRecord {
    #[serde(serialize_with = "hex8")]
    pub level: u32,
    #[serde(serialize_with = "hex8")]
    pub subleaf: u32,
    #[serde(serialize_with = "hex8")]
    pub eax: u32,
    #[serde(serialize_with = "hex8")]
    pub ebx: u32,
    #[serde(serialize_with = "hex8")]
    pub ecx: u32,
    #[serde(serialize_with = "hex8")]
    pub edx: u32,
}

fn record(out: &mut Vec<CpuidRecord>, leaf: u32, subleaf: u32, r: CpuidOut) {
    out.push(CpuidRecord {
        level: leaf,
        subleaf,
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    });
}

/// Upper bound of the subleaf range worth querying for a standard leaf.
/// Invalid subleaves answer all-zeros and are dropped, so over-scanning
/// is harmless; under-scanning loses data.
fn max_subleaf(leaf: u32) -> u32 {
    match leaf {
        // Deterministic cache parameters.
        0x04 => 63,
        // Structured extended feature flags: subleaf 0's EAX is the count.
        0x07 => cpuid(0x07, 0).eax,
        // Processor extended state enumeration.
        0x0D => 63,
        // Platform QoS monitoring.
        0x0F => 31,
        // L3 QoS enforcement.
        0x10 => 63,
        // Processor trace: subleaf 0's EAX is the count.
        0x14 => cpuid(0x14, 0).eax,
        _ => 0,
    }
}

/// Walks every standard and extended CPUID leaf the host reports.
pub fn walk() -> Vec<CpuidRecord> {
    let mut records = Vec::new();

    let max_eax = cpuid(0, 0).eax;
    for leaf in 0..=max_eax {
        // Leaf 3 is the P-III serial number; never query it.
        if leaf == 3 {
            record(&mut records, leaf, 0, CpuidOut::default());
            continue;
        }

        if leaf == 0x0B {
            // Extended topology: levels are enumerated until the CPU
            // answers with an empty level. Bits 7..0 of ECX always echo
            // the input, so mask them out of the validity test.
            for subleaf in 0..=255u32 {
                let r = cpuid(leaf, subleaf);
                if r.eax == 0 && r.ebx == 0 && (r.ecx & 0xFFFF_FF00) == 0 {
                    break;
                }
                record(&mut records, leaf, subleaf, r);
            }
            continue;
        }

        let max_ecx = max_subleaf(leaf);
        if max_ecx == 0 {
            record(&mut records, leaf, 0, cpuid(leaf, 0));
        } else {
            for subleaf in 0..=max_ecx {
                let r = cpuid(leaf, subleaf);
                if r.is_valid() {
                    record(&mut records, leaf, subleaf, r);
                }
            }
        }
    }

    let ext_base = 0x8000_0000u32;
    let max_ext = cpuid(ext_base, 0).eax.max(ext_base);
    for leaf in ext_base..=max_ext {
        record(&mut records, leaf, 0, cpuid(leaf, 0));
    }

    records
}

/// Vendor string from leaf 0 (EBX, EDX, ECX order).
pub fn vendor_string() -> String {
    let r = cpuid(0, 0);
    let mut bytes = Vec::with_capacity(12);
    for word in [r.ebx, r.edx, r.ecx] {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string()
}

/// Processor brand string from extended leaves 0x8000_0002..=0x8000_0004,
/// or an empty string if the CPU predates them.
pub fn brand_string() -> String {
    if cpuid(0x8000_0000, 0).eax < 0x8000_0004 {
        return String::new();
    }
    let mut bytes = Vec::with_capacity(48);
    for leaf in 0x8000_0002u32..=0x8000_0004 {
        let r = cpuid(leaf, 0);
        for word in [r.eax, r.ebx, r.ecx, r.edx] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
    }
    String::from_utf8_lossy(&bytes)
        .trim_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}

/// Family/model/stepping from leaf 1, with the extended-family and
/// extended-model folding from the SDM.
pub fn family_model_stepping() -> (u32, u32, u32) {
    let eax = cpuid(1, 0).eax;
    let stepping = eax & 0xF;
    let mut family = (eax >> 8) & 0xF;
    let mut model = (eax >> 4) & 0xF;

    if family == 0xF {
        family += (eax >> 20) & 0xFF;
    }
    if family == 0xF || family == 6 {
        model += ((eax >> 16) & 0xF) << 4;
    }
    (family, model, stepping)
}
