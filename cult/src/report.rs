//! The JSON report: one object with the tool header, the detected CPU,
//! and one record per measured (instruction, shape) pair.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde_derive::Serialize;

use cult_cpu::CpuInfo;

#[derive(Debug, Clone, Serialize)]
pub struct InstRecord {
    pub inst: String,
    pub lat: f64,
    pub rcp: f64,
}

#[derive(Serialize)]
struct Header {
    version: &'static str,
}

#[derive(Serialize)]
struct Report<'a> {
    cult: Header,
    #[serde(rename = "cpuInfo")]
    cpu_info: &'a CpuInfo,
    instructions: &'a [InstRecord],
}

fn render<W: Write>(writer: W, cpu: &CpuInfo, records: &[InstRecord]) -> io::Result<()> {
    let report = Report {
        cult: Header {
            version: env!("CARGO_PKG_VERSION"),
        },
        cpu_info: cpu,
        instructions: records,
    };
    let mut writer = BufWriter::new(writer);
    serde_json::to_writer_pretty(&mut writer, &report)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Writes the report to stdout.
pub fn write_to_stdout(cpu: &CpuInfo, records: &[InstRecord]) -> io::Result<()> {
    let stdout = io::stdout();
    render(stdout.lock(), cpu, records)
}

/// Writes the report to a file.
pub fn write_to_file(path: &Path, cpu: &CpuInfo, records: &[InstRecord]) -> io::Result<()> {
    render(File::create(path)?, cpu, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cult_cpu::FeatureSet;

    fn test_cpu() -> CpuInfo {
        CpuInfo {
            vendor: "GenuineIntel".to_string(),
            brand_string: "Test CPU".to_string(),
            family: 6,
            model: 0x9E,
            stepping: 10,
            uarch: "Kaby Lake".to_string(),
            arch_bits: 64,
            tsc_frequency: 3_000_000_000,
            features: vec!["SSE2".to_string()],
            cpuid: Vec::new(),
            feature_set: FeatureSet::new(),
        }
    }

    #[test]
    fn report_serializes_with_the_expected_keys() {
        let records = vec![InstRecord {
            inst: "add r32, r32".to_string(),
            lat: 1.0,
            rcp: 0.25,
        }];
        let mut out = Vec::new();
        render(&mut out, &test_cpu(), &records).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert!(value.get("cult").and_then(|c| c.get("version")).is_some());
        assert_eq!(
            value.pointer("/cpuInfo/vendor").and_then(|v| v.as_str()),
            Some("GenuineIntel")
        );
        assert_eq!(
            value.pointer("/cpuInfo/tscFrequency").and_then(|v| v.as_u64()),
            Some(3_000_000_000)
        );
        let insts = value.get("instructions").unwrap().as_array().unwrap();
        assert_eq!(insts.len(), 1);
        assert_eq!(
            insts[0].get("inst").and_then(|v| v.as_str()),
            Some("add r32, r32")
        );
        assert_eq!(insts[0].get("rcp").and_then(|v| v.as_f64()), Some(0.25));
    }
}
