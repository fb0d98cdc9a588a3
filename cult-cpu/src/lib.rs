//! Host CPU introspection for cult.
//!
//! Everything here is read-once-at-startup: the measurement core takes
//! a [`CpuInfo`] by reference and treats it as immutable for the whole
//! run.

pub mod affinity;
pub mod cpuid;
pub mod features;
pub mod tsc;
pub mod uarch;

use serde_derive::Serialize;

pub use affinity::pin_to_cpu;
pub use cpuid::CpuidRecord;
pub use features::FeatureSet;

/// Snapshot of the host CPU, detected once before any measurement.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    pub vendor: String,
    pub brand_string: String,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
    /// Microarchitecture codename, or empty when unknown.
    pub uarch: String,
    pub arch_bits: u32,
    /// TSC frequency in Hz; 0 when the CPU does not report it.
    pub tsc_frequency: u64,
    pub features: Vec<String>,
    pub cpuid: Vec<CpuidRecord>,
    #[serde(skip)]
    pub feature_set: FeatureSet,
}

impl CpuInfo {
    pub fn detect() -> CpuInfo {
        let (family, model, stepping) = cpuid::family_model_stepping();
        let vendor = cpuid::vendor_string();
        let feature_set = FeatureSet::detect();
        CpuInfo {
            uarch: uarch::microarch_name(&vendor, family, model).to_string(),
            vendor,
            brand_string: cpuid::brand_string(),
            family,
            model,
            stepping,
            arch_bits: if cfg!(target_pointer_width = "64") { 64 } else { 32 },
            tsc_frequency: tsc::tsc_frequency(),
            features: feature_set.names(),
            cpuid: cpuid::walk(),
            feature_set,
        }
    }
}
