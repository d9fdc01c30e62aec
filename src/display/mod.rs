/*
 *  display/mod.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Display subsystem - EPDC refresh engine for mxcfb panels
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

// Core trait definitions
pub mod traits;
pub mod error;

// Device knowledge
pub mod device;
pub mod waveform;

// Pixels
pub mod surface;
pub mod framebuffer;
pub mod sunxi;
pub mod dither;

// Refresh pipeline
pub mod region;
pub mod executor;
pub mod queue;
pub mod cursor;
pub mod engine;

// Refresh drivers
pub mod drivers;

// Re-exports for convenience
pub use traits::{DriverCapabilities, EinkControl, EinkDriver, PointerSource, RefreshCommand};
pub use error::DisplayError;
pub use device::{DeviceKind, DeviceProbe, DeviceProfile, DeviceQuirks, DeviceRegistry};
pub use waveform::{WaveformId, WaveformSet};
pub use surface::{PixelFormat, PixelSurface, SurfaceBuffer};
pub use framebuffer::{FbDevice, FbGeometry, MappedFramebuffer, MxcfbDriver};
pub use sunxi::{SunxiDriver, SunxiFramebuffer};
pub use dither::Ditherer;
pub use region::RegionClass;
pub use executor::{RefreshExecutor, RefreshOutcome, RefreshRequest, RefreshSettings};
pub use queue::{RefreshQueue, RefreshStats};
pub use cursor::{Cadence, CursorCanvas, CursorConfig, CursorRefreshStateMachine, CursorSprite};
pub use engine::{EinkEngine, EngineOptions};
