//! Time-stamp counter frequency detection.
//!
//! CPUID leaf 0x15 reports the TSC/crystal ratio on newer Intel parts.
//! When the crystal frequency field is zero the SDM's model table fills
//! the gap for Skylake/Kabylake-generation cores; anything else reports
//! 0 ("unknown"), which consumers must tolerate.

use crate::cpuid::{cpuid, family_model_stepping};

/// Detected TSC frequency in Hz, or 0 when the CPU does not report it.
pub fn tsc_frequency() -> u64 {
    if cpuid(0, 0).eax < 0x15 {
        return 0;
    }

    let leaf15 = cpuid(0x15, 0);
    if leaf15.eax == 0 || leaf15.ebx == 0 {
        return 0;
    }

    if leaf15.ecx != 0 {
        return u64::from(leaf15.ecx) * u64::from(leaf15.ebx) / u64::from(leaf15.eax);
    }

    // Crystal frequency not enumerated. Skylake and Kabylake client
    // parts use a 24 MHz crystal (SDM vol. 3, "Determining the
    // Processor Base Frequency").
    let (family, model, _) = family_model_stepping();
    if family == 6 && matches!(model, 0x4E | 0x5E | 0x8E | 0x9E) {
        return 24_000_000u64 * u64::from(leaf15.ebx) / u64::from(leaf15.eax);
    }

    0
}
