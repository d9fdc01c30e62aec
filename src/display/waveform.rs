/*
 *  display/waveform.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Waveform identifiers and the per-device default waveform set
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
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::display::device::DeviceProfile;

/// E-ink refresh algorithms understood by the mxcfb EPDC
///
/// Discriminants are the numeric codes the kernel expects in
/// `mxcfb_update_data::waveform_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u32)]
pub enum WaveformId {
    /// Panel initialisation, full white flash
    Init = 0,
    /// Direct update, 1-bit, fast
    Du = 1,
    /// Full 16-level grayscale
    Gc16 = 2,
    /// 4-level grayscale
    Gc4 = 3,
    /// Animation, 1-bit, fastest, heavy ghosting
    A2 = 4,
    /// Grayscale without flashing white
    Gl16 = 5,
    /// Ghost-reducing non-flashing update
    Reagl = 6,
    /// REAGL with dithering
    Reagld = 7,
    /// Let the EPDC choose
    Auto = 257,
}

impl WaveformId {
    pub const ALL: [WaveformId; 9] = [
        WaveformId::Init,
        WaveformId::Du,
        WaveformId::Gc16,
        WaveformId::Gc4,
        WaveformId::A2,
        WaveformId::Gl16,
        WaveformId::Reagl,
        WaveformId::Reagld,
        WaveformId::Auto,
    ];

    /// Numeric mode passed to the EPDC
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            WaveformId::Init => "INIT",
            WaveformId::Du => "DU",
            WaveformId::Gc16 => "GC16",
            WaveformId::Gc4 => "GC4",
            WaveformId::A2 => "A2",
            WaveformId::Gl16 => "GL16",
            WaveformId::Reagl => "REAGL",
            WaveformId::Reagld => "REAGLD",
            WaveformId::Auto => "AUTO",
        }
    }
}

impl fmt::Display for WaveformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WaveformId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        WaveformId::ALL
            .iter()
            .copied()
            .find(|w| w.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown waveform '{}'", wanted))
    }
}

/// The three waveforms the engine picks between per region class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveformSet {
    pub fullscreen: WaveformId,
    pub partial: WaveformId,
    pub fast: WaveformId,
}

impl Default for WaveformSet {
    fn default() -> Self {
        Self {
            fullscreen: WaveformId::Gc16,
            partial: WaveformId::Auto,
            fast: WaveformId::A2,
        }
    }
}

impl WaveformSet {
    /// Fixed decision table applied once at start-up.
    ///
    /// REAGL-aware panels get REAGLD, generation 7 and sunxi panels get
    /// REAGL; all three use DU for small fast updates.
    pub fn for_device(profile: &DeviceProfile) -> Self {
        let mut set = WaveformSet::default();

        if profile.is_reagl {
            set.partial = WaveformId::Reagld;
            set.fast = WaveformId::Du;
        } else if profile.mark == 7 {
            set.partial = WaveformId::Reagl;
            set.fast = WaveformId::Du;
        } else if profile.is_sunxi {
            set.partial = WaveformId::Reagl;
            set.fast = WaveformId::Du;
        }

        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::device::{DeviceRegistry, DeviceProfile};

    fn profile_for(codename: &str, model: u32) -> DeviceProfile {
        let quirks = DeviceRegistry::lookup(codename, model);
        DeviceProfile::from_quirks(quirks, codename, model, 1072, 1448, None)
    }

    #[test]
    fn test_default_table() {
        // Touch C, mark 4, nothing special
        let set = WaveformSet::for_device(&profile_for("trilogy", 320));
        assert_eq!(set, WaveformSet::default());
        assert_eq!(set.partial, WaveformId::Auto);
        assert_eq!(set.fast, WaveformId::A2);
    }

    #[test]
    fn test_reagl_device() {
        let set = WaveformSet::for_device(&profile_for("phoenix", 0));
        assert_eq!(set.fullscreen, WaveformId::Gc16);
        assert_eq!(set.partial, WaveformId::Reagld);
        assert_eq!(set.fast, WaveformId::Du);
    }

    #[test]
    fn test_mark7_and_sunxi_devices() {
        let clara = WaveformSet::for_device(&profile_for("nova", 0));
        assert_eq!((clara.partial, clara.fast), (WaveformId::Reagl, WaveformId::Du));

        let elipsa = WaveformSet::for_device(&profile_for("europa", 0));
        assert_eq!(elipsa.partial, WaveformId::Reagl);
        assert_eq!(elipsa.fast, WaveformId::Du);
    }

    #[test]
    fn test_names_round_trip_case_insensitive() {
        assert_eq!("reagld".parse::<WaveformId>(), Ok(WaveformId::Reagld));
        assert_eq!(" GC16 ".parse::<WaveformId>(), Ok(WaveformId::Gc16));
        assert!("GC17".parse::<WaveformId>().is_err());
        assert_eq!(WaveformId::Auto.code(), 257);
    }
}
