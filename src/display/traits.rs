/*
 *  display/traits.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Hardware and capability seams for the refresh engine
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

use embedded_graphics::prelude::*;
use embedded_graphics::primitives::Rectangle;

use crate::display::device::DeviceProfile;
use crate::display::error::DisplayError;
use crate::display::waveform::WaveformId;

/// What a refresh driver can do beyond the basic update
#[derive(Debug, Clone)]
pub struct DriverCapabilities {
    /// Short driver name for logs
    pub name: &'static str,

    /// Whether the EPDC can invert an update in hardware (night mode)
    pub supports_invert: bool,

    /// Whether `wait_for_update_complete` talks to real hardware
    pub supports_completion_wait: bool,
}

/// One fully resolved hardware refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshCommand {
    pub region: Rectangle,
    pub waveform: WaveformId,
    /// Full (flashing) update instead of partial
    pub flashing: bool,
    /// Ask the EPDC to invert the region
    pub inverted: bool,
    /// Marker the completion wait will look for
    pub marker: u32,
}

/// Minimal hardware abstraction - every refresh backend implements this
///
/// Only the refresh worker calls into a driver, so implementations may
/// assume a single caller.
pub trait EinkDriver: Send {
    /// Returns the capabilities of this driver
    fn capabilities(&self) -> &DriverCapabilities;

    /// Submit one update to the panel.
    ///
    /// A panel that refuses the update because it is frozen must report
    /// `DisplayError::DisplayFrozen`; everything else is `RefreshFailed`.
    fn send_update(&mut self, command: &RefreshCommand) -> Result<(), DisplayError>;

    /// Unblank the panel, the recovery step after a freeze
    fn unblank(&mut self) -> Result<(), DisplayError>;

    /// Block until the update tagged `marker` has been displayed
    fn wait_for_update_complete(&mut self, marker: u32) -> Result<(), DisplayError>;
}

/// Where the pointer currently is, in screen coordinates
pub trait PointerSource: Send {
    fn position(&self) -> Point;
}

/// Capability surface offered to the rest of the platform.
///
/// Handed out directly as a trait object; callers never look functions up
/// by name.
pub trait EinkControl {
    fn set_fullscreen_waveform(&mut self, waveform: WaveformId);
    fn set_partial_waveform(&mut self, waveform: WaveformId);
    fn set_fast_waveform(&mut self, waveform: WaveformId);

    /// Back to the device-derived waveform set
    fn reset_to_default_waveforms(&mut self);

    fn set_flashing_enabled(&mut self, enabled: bool);

    /// Flip night mode, returning the new state
    fn toggle_night_mode(&mut self) -> bool;

    /// Paint the screen white with a flashing full refresh; `wait` blocks
    /// until the panel has finished
    fn clear_screen(&mut self, wait: bool) -> Result<(), DisplayError>;

    fn enable_dithering(&mut self, software: bool, hardware: bool);

    /// Queue a refresh of `region`, optionally forcing the waveform
    fn manual_refresh(&mut self, region: Rectangle, forced: Option<WaveformId>) -> Result<(), DisplayError>;

    fn get_device_profile(&self) -> DeviceProfile;
}
