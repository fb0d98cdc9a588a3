//! Host feature detection, expressed in the instruction database's
//! vocabulary ([`iced_x86::CpuidFeature`]) so the measurement core can
//! intersect an instruction's requirements with the host directly.
//!
//! The mapping is deliberately one-way: CPUID bits we do not map are
//! treated as absent, which only ever causes an instruction to be
//! skipped, never to be run unsupported.

use iced_x86::CpuidFeature;
use rustc_hash::FxHashSet;

use crate::cpuid::{cpuid, xgetbv};

#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    set: FxHashSet<CpuidFeature>,
    permissive: bool,
}

impl FeatureSet {
    pub fn new() -> FeatureSet {
        FeatureSet::default()
    }

    /// A set that claims support for everything. Only meaningful for
    /// enumeration tests; never use it to drive execution.
    pub fn permissive() -> FeatureSet {
        FeatureSet {
            set: FxHashSet::default(),
            permissive: true,
        }
    }

    pub fn insert(&mut self, feature: CpuidFeature) {
        self.set.insert(feature);
    }

    pub fn has(&self, feature: CpuidFeature) -> bool {
        self.permissive || self.set.contains(&feature)
    }

    pub fn supports_all(&self, features: &[CpuidFeature]) -> bool {
        features.iter().all(|f| self.has(*f))
    }

    /// Feature names, sorted, for the report.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.set.iter().map(|f| format!("{f:?}")).collect();
        names.sort();
        names
    }

    /// Detects the host feature set from CPUID, gating AVX and AVX-512
    /// families on the OS having enabled the relevant XSAVE state.
    pub fn detect() -> FeatureSet {
        let mut fs = FeatureSet::new();

        // Baseline ISA levels every probe-capable CPU has.
        for f in [
            CpuidFeature::INTEL8086,
            CpuidFeature::INTEL186,
            CpuidFeature::INTEL286,
            CpuidFeature::INTEL386,
            CpuidFeature::INTEL486,
            CpuidFeature::CPUID,
            CpuidFeature::MULTIBYTENOP,
        ] {
            fs.insert(f);
        }

        let leaf1 = cpuid(1, 0);
        let max_leaf = cpuid(0, 0).eax;

        let edx_features = [
            (0, CpuidFeature::FPU),
            (4, CpuidFeature::TSC),
            (8, CpuidFeature::CX8),
            (15, CpuidFeature::CMOV),
            (23, CpuidFeature::MMX),
            (25, CpuidFeature::SSE),
            (26, CpuidFeature::SSE2),
        ];
        for (bit, f) in edx_features {
            if leaf1.edx & (1 << bit) != 0 {
                fs.insert(f);
            }
        }

        let ecx_features = [
            (0, CpuidFeature::SSE3),
            (1, CpuidFeature::PCLMULQDQ),
            (9, CpuidFeature::SSSE3),
            (13, CpuidFeature::CMPXCHG16B),
            (19, CpuidFeature::SSE4_1),
            (20, CpuidFeature::SSE4_2),
            (22, CpuidFeature::MOVBE),
            (23, CpuidFeature::POPCNT),
            (25, CpuidFeature::AES),
            (26, CpuidFeature::XSAVE),
            (30, CpuidFeature::RDRAND),
        ];
        for (bit, f) in ecx_features {
            if leaf1.ecx & (1 << bit) != 0 {
                fs.insert(f);
            }
        }

        // AVX state (XCR0.SSE | XCR0.YMM) and AVX-512 opmask/hi16/hi256
        // state must both be OS-enabled before we may execute the
        // corresponding instructions.
        let osxsave = leaf1.ecx & (1 << 27) != 0;
        let xcr0 = if osxsave { xgetbv(0) } else { 0 };
        let avx_enabled = osxsave && (xcr0 & 0x6) == 0x6;
        let avx512_enabled = avx_enabled && (xcr0 & 0xE0) == 0xE0;

        if avx_enabled {
            let avx_ecx = [
                (12, CpuidFeature::FMA),
                (28, CpuidFeature::AVX),
                (29, CpuidFeature::F16C),
            ];
            for (bit, f) in avx_ecx {
                if leaf1.ecx & (1 << bit) != 0 {
                    fs.insert(f);
                }
            }
        }

        if max_leaf >= 7 {
            let leaf7 = cpuid(7, 0);

            let plain_ebx = [
                (3, CpuidFeature::BMI1),
                (8, CpuidFeature::BMI2),
                (18, CpuidFeature::RDSEED),
                (19, CpuidFeature::ADX),
                (29, CpuidFeature::SHA),
            ];
            for (bit, f) in plain_ebx {
                if leaf7.ebx & (1 << bit) != 0 {
                    fs.insert(f);
                }
            }

            if leaf7.ecx & (1 << 8) != 0 {
                fs.insert(CpuidFeature::GFNI);
            }

            if avx_enabled {
                if leaf7.ebx & (1 << 5) != 0 {
                    fs.insert(CpuidFeature::AVX2);
                }
                if leaf7.ecx & (1 << 9) != 0 {
                    fs.insert(CpuidFeature::VAES);
                }
                if leaf7.ecx & (1 << 10) != 0 {
                    fs.insert(CpuidFeature::VPCLMULQDQ);
                }
            }

            if avx512_enabled {
                let avx512_ebx = [
                    (16, CpuidFeature::AVX512F),
                    (17, CpuidFeature::AVX512DQ),
                    (21, CpuidFeature::AVX512_IFMA),
                    (26, CpuidFeature::AVX512PF),
                    (27, CpuidFeature::AVX512ER),
                    (28, CpuidFeature::AVX512CD),
                    (30, CpuidFeature::AVX512BW),
                    (31, CpuidFeature::AVX512VL),
                ];
                for (bit, f) in avx512_ebx {
                    if leaf7.ebx & (1 << bit) != 0 {
                        fs.insert(f);
                    }
                }
                let avx512_ecx = [
                    (1, CpuidFeature::AVX512_VBMI),
                    (6, CpuidFeature::AVX512_VBMI2),
                    (11, CpuidFeature::AVX512_VNNI),
                    (12, CpuidFeature::AVX512_BITALG),
                    (14, CpuidFeature::AVX512_VPOPCNTDQ),
                ];
                for (bit, f) in avx512_ecx {
                    if leaf7.ecx & (1 << bit) != 0 {
                        fs.insert(f);
                    }
                }
                let avx512_edx = [
                    (2, CpuidFeature::AVX512_4VNNIW),
                    (3, CpuidFeature::AVX512_4FMAPS),
                    (8, CpuidFeature::AVX512_VP2INTERSECT),
                    (23, CpuidFeature::AVX512_FP16),
                ];
                for (bit, f) in avx512_edx {
                    if leaf7.edx & (1 << bit) != 0 {
                        fs.insert(f);
                    }
                }
                if leaf7.eax >= 1 && cpuid(7, 1).eax & (1 << 5) != 0 {
                    fs.insert(CpuidFeature::AVX512_BF16);
                }
            }
        }

        let max_ext = cpuid(0x8000_0000, 0).eax;
        if max_ext >= 0x8000_0001 {
            let ext1 = cpuid(0x8000_0001, 0);
            let ext_ecx = [
                (5, CpuidFeature::LZCNT),
                (6, CpuidFeature::SSE4A),
                (8, CpuidFeature::PREFETCHW),
                (21, CpuidFeature::TBM),
            ];
            for (bit, f) in ext_ecx {
                if ext1.ecx & (1 << bit) != 0 {
                    fs.insert(f);
                }
            }
            if avx_enabled {
                if ext1.ecx & (1 << 11) != 0 {
                    fs.insert(CpuidFeature::XOP);
                }
                if ext1.ecx & (1 << 16) != 0 {
                    fs.insert(CpuidFeature::FMA4);
                }
            }
            if ext1.edx & (1 << 27) != 0 {
                fs.insert(CpuidFeature::RDTSCP);
            }
            if ext1.edx & (1 << 29) != 0 {
                fs.insert(CpuidFeature::X64);
            }
        }

        fs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_set_has_everything() {
        let fs = FeatureSet::permissive();
        assert!(fs.has(CpuidFeature::AVX512_VP2INTERSECT));
        assert!(fs.supports_all(&[CpuidFeature::X64, CpuidFeature::TBM]));
    }

    #[test]
    fn empty_set_has_nothing() {
        let fs = FeatureSet::new();
        assert!(!fs.has(CpuidFeature::SSE2));
    }

    #[test]
    fn names_are_sorted_and_deduplicated() {
        let mut fs = FeatureSet::new();
        fs.insert(CpuidFeature::SSE2);
        fs.insert(CpuidFeature::AVX);
        fs.insert(CpuidFeature::SSE2);
        assert_eq!(fs.names(), vec!["AVX".to_string(), "SSE2".to_string()]);
    }
}
