/*
 *  display/device.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Device capability model: the Kobo quirk registry and detection
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use embedded_graphics::geometry::Size;
use log::{debug, info, warn};

use crate::display::error::DisplayError;
use crate::display::framebuffer::{physical_size_mm, FbDevice};

/// Known reader models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    TouchAB,
    TouchC,
    Mini,
    Glo,
    GloHD,
    Touch2,
    Aura,
    AuraHD,
    AuraH2O,
    AuraH2O2V1,
    AuraH2O2V2,
    AuraOne,
    AuraEdition2V1,
    AuraEdition2V2,
    ClaraHD,
    Forma,
    LibraH2O,
    Nia,
    Elipsa,
    Sage,
    Libra2,
    Clara2E,
}

impl DeviceKind {
    pub fn marketing_name(self) -> &'static str {
        match self {
            DeviceKind::TouchAB => "Kobo Touch A/B",
            DeviceKind::TouchC => "Kobo Touch C",
            DeviceKind::Mini => "Kobo Mini",
            DeviceKind::Glo => "Kobo Glo",
            DeviceKind::GloHD => "Kobo Glo HD",
            DeviceKind::Touch2 => "Kobo Touch 2.0",
            DeviceKind::Aura => "Kobo Aura",
            DeviceKind::AuraHD => "Kobo Aura HD",
            DeviceKind::AuraH2O => "Kobo Aura H2O",
            DeviceKind::AuraH2O2V1 => "Kobo Aura H2O Edition 2",
            DeviceKind::AuraH2O2V2 => "Kobo Aura H2O Edition 2 (rev 2)",
            DeviceKind::AuraOne => "Kobo Aura One",
            DeviceKind::AuraEdition2V1 => "Kobo Aura Edition 2",
            DeviceKind::AuraEdition2V2 => "Kobo Aura Edition 2 (rev 2)",
            DeviceKind::ClaraHD => "Kobo Clara HD",
            DeviceKind::Forma => "Kobo Forma",
            DeviceKind::LibraH2O => "Kobo Libra H2O",
            DeviceKind::Nia => "Kobo Nia",
            DeviceKind::Elipsa => "Kobo Elipsa",
            DeviceKind::Sage => "Kobo Sage",
            DeviceKind::Libra2 => "Kobo Libra 2",
            DeviceKind::Clara2E => "Kobo Clara 2E",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marketing_name())
    }
}

/// Static per-model facts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceQuirks {
    pub kind: DeviceKind,
    /// EPDC generation
    pub mark: u32,
    pub dpi: u32,
    pub is_reagl: bool,
    pub is_sunxi: bool,
    pub has_gsensor: bool,
    pub has_reliable_completion_wait: bool,
}

const fn quirks(kind: DeviceKind, mark: u32, dpi: u32) -> DeviceQuirks {
    DeviceQuirks {
        kind,
        mark,
        dpi,
        is_reagl: false,
        is_sunxi: false,
        has_gsensor: false,
        has_reliable_completion_wait: true,
    }
}

static TRILOGY_AB: DeviceQuirks = quirks(DeviceKind::TouchAB, 3, 200);
static TRILOGY_C: DeviceQuirks = quirks(DeviceKind::TouchC, 4, 200);
static SNOW_V1: DeviceQuirks = quirks(DeviceKind::AuraH2O2V1, 6, 265);
static SNOW_V2: DeviceQuirks = quirks(DeviceKind::AuraH2O2V2, 7, 265);
static STAR_V1: DeviceQuirks = quirks(DeviceKind::AuraEdition2V1, 6, 212);
static STAR_V2: DeviceQuirks = quirks(DeviceKind::AuraEdition2V2, 7, 212);

/// Codenames that need no model number to resolve
static REGISTRY: &[(&str, DeviceQuirks)] = &[
    ("pixie", quirks(DeviceKind::Mini, 4, 200)),
    ("kraken", quirks(DeviceKind::Glo, 4, 212)),
    ("alyssum", quirks(DeviceKind::GloHD, 6, 300)),
    ("pika", quirks(DeviceKind::Touch2, 6, 167)),
    ("phoenix", DeviceQuirks { is_reagl: true, ..quirks(DeviceKind::Aura, 5, 212) }),
    ("dragon", quirks(DeviceKind::AuraHD, 4, 265)),
    ("dahlia", quirks(DeviceKind::AuraH2O, 5, 265)),
    ("daylight", quirks(DeviceKind::AuraOne, 6, 300)),
    ("nova", quirks(DeviceKind::ClaraHD, 7, 300)),
    ("frost", quirks(DeviceKind::Forma, 7, 300)),
    // completion waits on the Libra H2O time out for no reason
    ("storm", DeviceQuirks { has_reliable_completion_wait: false, ..quirks(DeviceKind::LibraH2O, 7, 300) }),
    ("luna", quirks(DeviceKind::Nia, 7, 212)),
    ("europa", DeviceQuirks { is_sunxi: true, ..quirks(DeviceKind::Elipsa, 8, 227) }),
    ("cadmus", DeviceQuirks { is_sunxi: true, has_gsensor: true, ..quirks(DeviceKind::Sage, 8, 300) }),
    ("io", DeviceQuirks { has_gsensor: true, ..quirks(DeviceKind::Libra2, 7, 300) }),
    ("goldfinch", DeviceQuirks { has_gsensor: true, ..quirks(DeviceKind::Clara2E, 7, 300) }),
];

/// Lookup into the fixed quirk table
pub struct DeviceRegistry;

impl DeviceRegistry {
    /// Resolve a codename, using the model number to split hardware
    /// revisions. Unknown codenames resolve to the Touch C.
    pub fn lookup(codename: &str, model_number: u32) -> &'static DeviceQuirks {
        match codename {
            "trilogy" if model_number == 310 => &TRILOGY_AB,
            "trilogy" => &TRILOGY_C,
            "snow" if model_number == 374 => &SNOW_V1,
            "snow" => &SNOW_V2,
            "star" if model_number == 375 => &STAR_V1,
            "star" => &STAR_V2,
            _ => REGISTRY
                .iter()
                .find(|(name, _)| *name == codename)
                .map(|(_, q)| q)
                .unwrap_or(&TRILOGY_C),
        }
    }

    pub fn is_known(codename: &str) -> bool {
        matches!(codename, "trilogy" | "snow" | "star") || REGISTRY.iter().any(|(name, _)| *name == codename)
    }
}

/// Everything the engine needs to know about the reader it runs on.
/// Built once at start-up and never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub kind: DeviceKind,
    pub codename: String,
    pub model_number: u32,
    pub mark: u32,
    pub dpi: u32,
    pub width: u32,
    pub height: u32,
    /// Panel size in mm
    pub physical_size: Size,
    pub is_reagl: bool,
    pub is_sunxi: bool,
    pub has_gsensor: bool,
    pub has_reliable_completion_wait: bool,
    pub requires_explicit_wait: bool,
}

impl DeviceProfile {
    /// Combine table facts with what the framebuffer reported. Without a
    /// reported panel size it is derived from the DPI.
    pub fn from_quirks(
        quirks: &DeviceQuirks,
        codename: &str,
        model_number: u32,
        width: u32,
        height: u32,
        physical_size: Option<Size>,
    ) -> Self {
        let physical_size = physical_size.unwrap_or_else(|| {
            Size::new(pixels_to_mm(width, quirks.dpi), pixels_to_mm(height, quirks.dpi))
        });

        Self {
            kind: quirks.kind,
            codename: codename.to_string(),
            model_number,
            mark: quirks.mark,
            dpi: quirks.dpi,
            width,
            height,
            physical_size,
            is_reagl: quirks.is_reagl,
            is_sunxi: quirks.is_sunxi,
            has_gsensor: quirks.has_gsensor,
            has_reliable_completion_wait: quirks.has_reliable_completion_wait,
            requires_explicit_wait: false,
        }
    }

    pub fn screen_size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

fn pixels_to_mm(pixels: u32, dpi: u32) -> u32 {
    if dpi == 0 {
        return 0;
    }
    (pixels as f64 * 25.4 / dpi as f64).round() as u32
}

/// Where detection looks for its inputs
#[derive(Debug, Clone)]
pub struct DeviceProbe {
    /// Script that prints the codename
    pub config_script: PathBuf,
    /// Firmware version file, model number in the sixth field
    pub version_file: PathBuf,
    /// Framebuffer nodes, first that opens wins
    pub fb_candidates: Vec<PathBuf>,
    /// Skip the script and environment entirely
    pub codename_override: Option<String>,
}

impl Default for DeviceProbe {
    fn default() -> Self {
        Self {
            config_script: PathBuf::from("/bin/kobo_config.sh"),
            version_file: PathBuf::from("/mnt/onboard/.kobo/version"),
            fb_candidates: vec![PathBuf::from("/dev/fb0"), PathBuf::from("/dev/graphics/fb0")],
            codename_override: None,
        }
    }
}

impl DeviceProbe {
    pub fn codename(&self) -> String {
        if let Some(name) = &self.codename_override {
            return name.trim().to_string();
        }
        if self.config_script.exists() {
            match Command::new(&self.config_script).output() {
                Ok(out) => return String::from_utf8_lossy(&out.stdout).trim().to_string(),
                Err(e) => warn!("{} failed: {}", self.config_script.display(), e),
            }
        }
        std::env::var("DEVICE_CODENAME").map(|s| s.trim().to_string()).unwrap_or_default()
    }

    /// Model number from the version file; 0 when absent or unreadable
    pub fn model_number(&self) -> u32 {
        match fs::read_to_string(&self.version_file) {
            Ok(contents) => parse_model_number(&contents),
            Err(e) => {
                debug!("no version file {}: {}", self.version_file.display(), e);
                0
            }
        }
    }
}

/// Sixth comma separated field with leading zeros and dashes removed
pub fn parse_model_number(version: &str) -> u32 {
    version
        .lines()
        .next()
        .and_then(|line| line.split(',').nth(5))
        .map(|field| field.trim().trim_start_matches(['0', '-']))
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

/// Identify the reader and read the screen geometry.
///
/// Fails with `HardwareUnavailable` when no framebuffer node opens.
pub fn detect(probe: &DeviceProbe) -> Result<DeviceProfile, DisplayError> {
    let codename = probe.codename();
    let model_number = probe.model_number();
    let quirks = DeviceRegistry::lookup(&codename, model_number);
    if !DeviceRegistry::is_known(&codename) {
        warn!("unknown device codename '{}', assuming {}", codename, quirks.kind);
    }

    let fb = FbDevice::open_first(&probe.fb_candidates)?;
    let var = fb.var_screeninfo()?;
    let profile = DeviceProfile::from_quirks(
        quirks,
        &codename,
        model_number,
        var.xres,
        var.yres,
        physical_size_mm(&var),
    );

    info!(
        "device: {} ({} / {}), mark {}, {}x{} @ {} dpi",
        profile.kind,
        profile.codename,
        profile.model_number,
        profile.mark,
        profile.width,
        profile.height,
        profile.dpi
    );
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_split_by_model_number() {
        assert_eq!(DeviceRegistry::lookup("trilogy", 310).kind, DeviceKind::TouchAB);
        assert_eq!(DeviceRegistry::lookup("trilogy", 310).mark, 3);
        assert_eq!(DeviceRegistry::lookup("trilogy", 320).kind, DeviceKind::TouchC);
        assert_eq!(DeviceRegistry::lookup("snow", 374).mark, 6);
        assert_eq!(DeviceRegistry::lookup("snow", 378).mark, 7);
        assert_eq!(DeviceRegistry::lookup("star", 375).kind, DeviceKind::AuraEdition2V1);
        assert_eq!(DeviceRegistry::lookup("star", 379).kind, DeviceKind::AuraEdition2V2);
    }

    #[test]
    fn test_unknown_codename_falls_back_to_touch_c() {
        let q = DeviceRegistry::lookup("nonesuch", 999);
        assert_eq!(q.kind, DeviceKind::TouchC);
        assert!(!DeviceRegistry::is_known("nonesuch"));
        assert!(DeviceRegistry::is_known("star"));
    }

    #[test]
    fn test_quirk_flags() {
        assert!(DeviceRegistry::lookup("phoenix", 0).is_reagl);
        assert!(!DeviceRegistry::lookup("storm", 0).has_reliable_completion_wait);
        assert!(DeviceRegistry::lookup("nova", 0).has_reliable_completion_wait);
        let sage = DeviceRegistry::lookup("cadmus", 0);
        assert!(sage.is_sunxi && sage.has_gsensor);
        assert_eq!(sage.mark, 8);
        assert_eq!(DeviceRegistry::lookup("pika", 0).dpi, 167);
    }

    #[test]
    fn test_physical_size_fallback_from_dpi() {
        let q = DeviceRegistry::lookup("nova", 0);
        let p = DeviceProfile::from_quirks(q, "nova", 376, 1072, 1448, None);
        // 1072 * 25.4 / 300 = 90.76, 1448 * 25.4 / 300 = 122.6
        assert_eq!(p.physical_size, Size::new(91, 123));
        assert!(!p.requires_explicit_wait);

        let p = DeviceProfile::from_quirks(q, "nova", 376, 1072, 1448, Some(Size::new(90, 122)));
        assert_eq!(p.physical_size, Size::new(90, 122));
    }

    #[test]
    fn test_parse_model_number() {
        let line = "N249390001234,4.1.15,4.38.21908,4.1.15,4.1.15,00000000-0000-0000-0000-000000000376\n";
        assert_eq!(parse_model_number(line), 376);
        assert_eq!(parse_model_number("a,b,c,d,e,00000310"), 310);
        assert_eq!(parse_model_number("too,short"), 0);
        assert_eq!(parse_model_number(""), 0);
    }

    #[test]
    fn test_detect_without_framebuffer_is_unavailable() {
        let probe = DeviceProbe {
            config_script: PathBuf::from("/nonexistent/kobo_config.sh"),
            version_file: PathBuf::from("/nonexistent/version"),
            fb_candidates: vec![PathBuf::from("/nonexistent/fb0")],
            codename_override: Some("frost".into()),
        };
        assert_eq!(probe.codename(), "frost");
        assert_eq!(probe.model_number(), 0);
        assert!(matches!(detect(&probe), Err(DisplayError::HardwareUnavailable(_))));
    }
}
