//! Family/model → microarchitecture codename.
//!
//! Consumers comparing reports across machines want a human-readable
//! core name next to the raw family/model pair. The table only covers
//! desktop/server parts that are plausible measurement hosts; anything
//! unknown reports an empty string rather than a guess.

/// Codename for a (vendor, family, model) triple, or `""`.
pub fn microarch_name(vendor: &str, family: u32, model: u32) -> &'static str {
    match vendor {
        "GenuineIntel" => intel_name(family, model),
        "AuthenticAMD" => amd_name(family, model),
        _ => "",
    }
}

fn intel_name(family: u32, model: u32) -> &'static str {
    if family != 6 {
        return "";
    }
    match model {
        0x2A | 0x2D => "Sandy Bridge",
        0x3A | 0x3E => "Ivy Bridge",
        0x3C | 0x3F | 0x45 | 0x46 => "Haswell",
        0x3D | 0x47 | 0x4F | 0x56 => "Broadwell",
        0x4E | 0x5E | 0x55 => "Skylake",
        0x8E | 0x9E => "Kaby Lake",
        0xA5 | 0xA6 => "Comet Lake",
        0x66 => "Cannon Lake",
        0x6A | 0x6C | 0x7D | 0x7E => "Ice Lake",
        0x8C | 0x8D => "Tiger Lake",
        0xA7 => "Rocket Lake",
        0x97 | 0x9A | 0xBF => "Alder Lake",
        0xB7 | 0xBA => "Raptor Lake",
        0x8F => "Sapphire Rapids",
        0xCF => "Emerald Rapids",
        0xAA | 0xAC => "Meteor Lake",
        0xC6 => "Arrow Lake",
        _ => "",
    }
}

fn amd_name(family: u32, model: u32) -> &'static str {
    match family {
        0x15 => "Bulldozer",
        0x16 => "Jaguar",
        0x17 => match model {
            0x01 | 0x08 | 0x11 | 0x18 => "Zen",
            0x31 | 0x60 | 0x68 | 0x71 | 0x90 => "Zen 2",
            _ => "Zen",
        },
        0x19 => match model {
            0x61 | 0x70..=0x7F => "Zen 4",
            _ => "Zen 3",
        },
        0x1A => "Zen 5",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_cores_resolve() {
        assert_eq!(microarch_name("GenuineIntel", 6, 0x9E), "Kaby Lake");
        assert_eq!(microarch_name("GenuineIntel", 6, 0x55), "Skylake");
        assert_eq!(microarch_name("AuthenticAMD", 0x17, 0x71), "Zen 2");
        assert_eq!(microarch_name("AuthenticAMD", 0x19, 0x21), "Zen 3");
    }

    #[test]
    fn unknown_parts_stay_empty() {
        assert_eq!(microarch_name("GenuineIntel", 5, 0x02), "");
        assert_eq!(microarch_name("SomethingElse", 6, 0x9E), "");
        assert_eq!(microarch_name("GenuineIntel", 6, 0xFF), "");
    }
}
