//! Project-local INI parsing (§6 / §2A): the `[main]`/device sections of the
//! Project INI format that are narrow enough to live in the core, as opposed
//! to the curated multi-device catalog that stays an external collaborator
//! (§2B's "cascading device-name resolution left as an external concern").

use std::path::{Path, PathBuf};

use ini::{Ini, Properties};

use crate::device::{ArmDevice, AvrDevice, DeviceDescriptor};
use crate::error::{PigroError, Result};

/// The project-local pointers and inline device section a `pigro.ini`-style
/// file carries (§3).
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub device_name: String,
    pub hex_path: PathBuf,
    pub device: DeviceDescriptor,
}

impl ProjectConfig {
    /// Loads `[main] device=…, hex=…` plus the inline `[<device_name>]`
    /// section from a single INI file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path)
            .map_err(|e| PigroError::ConfigParseError(format!("{}: {e}", path.display())))?;

        let main = ini
            .section(Some("main"))
            .ok_or_else(|| PigroError::ConfigMissingSection("main".into()))?;
        let device_name = get(main, "main", "device")?.to_string();
        let hex_path = PathBuf::from(get(main, "main", "hex")?);

        let device_section = ini
            .section(Some(device_name.as_str()))
            .ok_or_else(|| PigroError::ConfigMissingSection(device_name.clone()))?;
        let device = parse_device(&device_name, device_section)?;

        Ok(ProjectConfig {
            device_name,
            hex_path,
            device,
        })
    }
}

fn get<'a>(section: &'a Properties, section_name: &str, key: &str) -> Result<&'a str> {
    section.get(key).ok_or_else(|| PigroError::ConfigMissingKey {
        section: section_name.to_string(),
        key: key.to_string(),
    })
}

fn parse_device(name: &str, section: &Properties) -> Result<DeviceDescriptor> {
    match get(section, name, "type")? {
        "avr" => parse_avr(name, section),
        "arm" => parse_arm(name, section),
        other => Err(PigroError::ConfigParseError(format!(
            "unknown device type '{other}', expected 'avr' or 'arm'"
        ))),
    }
}

fn parse_avr(name: &str, section: &Properties) -> Result<DeviceDescriptor> {
    let signature = parse_signature(get(section, name, "device_code")?)?;
    let page_word_size = parse_num(get(section, name, "page_size")?)? as u8;
    let page_count = parse_num(get(section, name, "page_count")?)? as u8;
    let paged = section
        .get("paged")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    let fuse_low = parse_optional_u8(section, "fuse_low")?;
    let fuse_high = parse_optional_u8(section, "fuse_high")?;
    let fuse_ext = parse_optional_u8(section, "fuse_ext")?;

    Ok(DeviceDescriptor::Avr(AvrDevice {
        name: name.to_string(),
        signature,
        page_word_size,
        page_count,
        paged,
        fuse_low,
        fuse_high,
        fuse_ext,
    }))
}

fn parse_arm(name: &str, section: &Properties) -> Result<DeviceDescriptor> {
    let page_size = parse_size(get(section, name, "page_size")?)?;
    let flash_size = parse_size(get(section, name, "flash_size")?)?;
    // STM32F1-class Cortex-M3 IDCODE is fixed by the silicon family (§4.6);
    // the project file does not carry a per-device IDCODE.
    let idcode = 0x3BA0_0477;
    let device = ArmDevice::new(name.to_string(), idcode, page_size, flash_size)?;
    Ok(DeviceDescriptor::Arm(device))
}

fn parse_optional_u8(section: &Properties, key: &str) -> Result<Option<u8>> {
    section
        .get(key)
        .map(parse_num)
        .transpose()
        .map(|v| v.map(|v| v as u8))
}

fn parse_signature(s: &str) -> Result<[u8; 3]> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(PigroError::ConfigParseError(format!(
            "device_code must have 3 comma-separated bytes, got '{s}'"
        )));
    }
    let mut sig = [0u8; 3];
    for (i, p) in parts.iter().enumerate() {
        sig[i] = parse_num(p)? as u8;
    }
    Ok(sig)
}

fn parse_num(s: &str) -> Result<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| PigroError::ConfigParseError(e.to_string()))
    } else {
        s.parse::<u32>().map_err(|e| PigroError::ConfigParseError(e.to_string()))
    }
}

/// Parses a size with an optional `k`/`m` suffix (§6).
fn parse_size(s: &str) -> Result<u32> {
    let s = s.trim();
    let (digits, mult) = if let Some(d) = s.strip_suffix(['k', 'K']) {
        (d, 1024)
    } else if let Some(d) = s.strip_suffix(['m', 'M']) {
        (d, 1024 * 1024)
    } else {
        (s, 1)
    };
    Ok(parse_num(digits)? * mult)
}
