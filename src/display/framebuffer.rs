/*
 *  display/framebuffer.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Linux fbdev access: screen info, mapping, teardown and the mxcfb
 *  EPDC update/wait ioctls used on i.MX based Kobo readers
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

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use embedded_graphics::geometry::Size;
use log::{debug, info, warn};
use memmap2::{MmapMut, MmapOptions};

use crate::display::device::DeviceProfile;
use crate::display::error::DisplayError;
use crate::display::surface::{PixelFormat, PixelSurface};
use crate::display::traits::{DriverCapabilities, EinkDriver, RefreshCommand};

// linux/fb.h
const FBIOGET_VSCREENINFO: u32 = 0x4600;
const FBIOPUT_VSCREENINFO: u32 = 0x4601;
const FBIOGET_FSCREENINFO: u32 = 0x4602;
const FBIOBLANK: u32 = 0x4611;
const FB_BLANK_UNBLANK: usize = 0;
const FB_ACTIVATE_FORCE: u32 = 128;
const GRAYSCALE_8BIT: u32 = 1;

// linux/mxcfb.h
const UPDATE_MODE_PARTIAL: u32 = 0;
const UPDATE_MODE_FULL: u32 = 1;
const TEMP_USE_AMBIENT: i32 = 0x1000;
const EPDC_FLAG_ENABLE_INVERSION: u32 = 0x01;

const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
    (1 << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

pub(crate) const fn iowr(ty: u8, nr: u8, size: usize) -> u32 {
    (3 << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

const MXCFB_SEND_UPDATE_V1_NTX: u32 = iow(b'F', 0x2E, size_of::<MxcfbUpdateDataV1Ntx>());
const MXCFB_SEND_UPDATE_V2: u32 = iow(b'F', 0x2E, size_of::<MxcfbUpdateDataV2>());
const MXCFB_WAIT_FOR_UPDATE_COMPLETE_V1: u32 = iow(b'F', 0x2F, size_of::<u32>());
const MXCFB_WAIT_FOR_UPDATE_COMPLETE_V3: u32 = iowr(b'F', 0x2F, size_of::<MxcfbUpdateMarkerData>());

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbBitfield {
    pub offset: u32,
    pub length: u32,
    pub msb_right: u32,
}

/// `struct fb_var_screeninfo`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbVarScreeninfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: FbBitfield,
    pub green: FbBitfield,
    pub blue: FbBitfield,
    pub transp: FbBitfield,
    pub nonstd: u32,
    pub activate: u32,
    /// physical height in mm
    pub height: u32,
    /// physical width in mm
    pub width: u32,
    pub accel_flags: u32,
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    pub sync: u32,
    pub vmode: u32,
    pub rotate: u32,
    pub colorspace: u32,
    pub reserved: [u32; 4],
}

/// `struct fb_fix_screeninfo`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbFixScreeninfo {
    pub id: [u8; 16],
    pub smem_start: libc::c_ulong,
    pub smem_len: u32,
    pub type_: u32,
    pub type_aux: u32,
    pub visual: u32,
    pub xpanstep: u16,
    pub ypanstep: u16,
    pub ywrapstep: u16,
    pub line_length: u32,
    pub mmio_start: libc::c_ulong,
    pub mmio_len: u32,
    pub accel: u32,
    pub capabilities: u16,
    pub reserved: [u16; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct MxcfbRect {
    top: u32,
    left: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct MxcfbAltBufferDataNtx {
    virt_addr: usize,
    phys_addr: u32,
    width: u32,
    height: u32,
    alt_update_region: MxcfbRect,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct MxcfbUpdateDataV1Ntx {
    update_region: MxcfbRect,
    waveform_mode: u32,
    update_mode: u32,
    update_marker: u32,
    temp: i32,
    flags: u32,
    alt_buffer_data: MxcfbAltBufferDataNtx,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct MxcfbAltBufferData {
    phys_addr: u32,
    width: u32,
    height: u32,
    alt_update_region: MxcfbRect,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct MxcfbUpdateDataV2 {
    update_region: MxcfbRect,
    waveform_mode: u32,
    update_mode: u32,
    update_marker: u32,
    temp: i32,
    flags: u32,
    dither_mode: i32,
    quant_bit: i32,
    alt_buffer_data: MxcfbAltBufferData,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct MxcfbUpdateMarkerData {
    update_marker: u32,
    collision_test: u32,
}

/// What the screen info says about the visible area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FbGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: PixelFormat,
    /// Byte offset of the visible area inside the mapping
    pub origin: usize,
    /// Panel size in mm when the driver reports a usable value
    pub physical_mm: Option<Size>,
    pub map_len: usize,
}

impl FbGeometry {
    pub fn from_screeninfo(var: &FbVarScreeninfo, fix: &FbFixScreeninfo) -> Result<Self, DisplayError> {
        let format = match (var.bits_per_pixel, var.red.offset) {
            (8, _) => PixelFormat::Gray8,
            (16, _) => PixelFormat::Rgb565,
            (24, 16) => PixelFormat::Rgb888,
            (24, _) => PixelFormat::Bgr888,
            (32, 0) => PixelFormat::Xbgr8888,
            (32, _) => PixelFormat::Xrgb8888,
            (bpp, _) => {
                return Err(DisplayError::HardwareUnavailable(format!(
                    "unsupported framebuffer depth {} bpp",
                    bpp
                )));
            }
        };
        let stride = if fix.line_length > 0 {
            fix.line_length as usize
        } else {
            var.xres_virtual as usize * format.bytes_per_pixel()
        };
        let origin = var.yoffset as usize * stride + var.xoffset as usize * format.bytes_per_pixel();
        let map_len = if fix.smem_len > 0 {
            fix.smem_len as usize
        } else {
            stride * var.yres_virtual.max(var.yres) as usize
        };
        if origin + stride * var.yres as usize > map_len {
            return Err(DisplayError::HardwareUnavailable(format!(
                "visible area {}x{} does not fit a {} byte framebuffer",
                var.xres, var.yres, map_len
            )));
        }

        Ok(Self {
            width: var.xres,
            height: var.yres,
            stride,
            format,
            origin,
            physical_mm: physical_size_mm(var),
            map_len,
        })
    }
}

/// Reported panel size, skipping the zero and all-ones placeholders
pub fn physical_size_mm(var: &FbVarScreeninfo) -> Option<Size> {
    let valid = |v: u32| v != 0 && v != u32::MAX;
    if valid(var.width) && valid(var.height) {
        Some(Size::new(var.width, var.height))
    } else {
        None
    }
}

/// An open framebuffer node.
///
/// The screen info seen at open time is put back when the last handle
/// drops, so a changed depth does not outlive the engine.
#[derive(Debug)]
pub struct FbDevice {
    file: File,
    path: PathBuf,
    original: FbVarScreeninfo,
}

impl FbDevice {
    /// Open read-write, falling back to read-only
    pub fn open(path: &Path) -> Result<Self, DisplayError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .or_else(|err| {
                debug!("{} not writable ({}), trying read-only", path.display(), err);
                OpenOptions::new().read(true).open(path)
            })
            .map_err(|e| DisplayError::HardwareUnavailable(format!("{}: {}", path.display(), e)))?;

        let mut device = Self { file, path: path.to_path_buf(), original: FbVarScreeninfo::default() };
        device.original = device.var_screeninfo()?;
        debug!(
            "opened {}: {}x{} @ {} bpp, rotate {}",
            path.display(),
            device.original.xres,
            device.original.yres,
            device.original.bits_per_pixel,
            device.original.rotate
        );
        Ok(device)
    }

    /// First candidate that opens
    pub fn open_first(candidates: &[PathBuf]) -> Result<Self, DisplayError> {
        let mut failures = Vec::new();
        for path in candidates {
            match Self::open(path) {
                Ok(device) => return Ok(device),
                Err(e) => failures.push(e.to_string()),
            }
        }
        Err(DisplayError::HardwareUnavailable(if failures.is_empty() {
            "no framebuffer device configured".to_string()
        } else {
            failures.join("; ")
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl(&self, request: u32, arg: *mut libc::c_void) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg) };
        if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    pub fn var_screeninfo(&self) -> Result<FbVarScreeninfo, DisplayError> {
        let mut info = FbVarScreeninfo::default();
        self.ioctl(FBIOGET_VSCREENINFO, &mut info as *mut _ as *mut libc::c_void)
            .map_err(|e| DisplayError::HardwareUnavailable(format!("FBIOGET_VSCREENINFO: {}", e)))?;
        Ok(info)
    }

    pub fn fix_screeninfo(&self) -> Result<FbFixScreeninfo, DisplayError> {
        let mut info = FbFixScreeninfo::default();
        self.ioctl(FBIOGET_FSCREENINFO, &mut info as *mut _ as *mut libc::c_void)
            .map_err(|e| DisplayError::HardwareUnavailable(format!("FBIOGET_FSCREENINFO: {}", e)))?;
        Ok(info)
    }

    fn put_var_screeninfo(&self, info: &FbVarScreeninfo) -> io::Result<()> {
        let mut info = *info;
        self.ioctl(FBIOPUT_VSCREENINFO, &mut info as *mut _ as *mut libc::c_void)
    }

    /// Switch bit depth, keeping the current rotation
    pub fn set_depth(&self, bits_per_pixel: u32) -> Result<(), DisplayError> {
        let mut info = self.var_screeninfo()?;
        if info.bits_per_pixel == bits_per_pixel {
            return Ok(());
        }
        info.bits_per_pixel = bits_per_pixel;
        info.grayscale = if bits_per_pixel == 8 { GRAYSCALE_8BIT } else { 0 };
        info.activate = FB_ACTIVATE_FORCE;
        self.put_var_screeninfo(&info)
            .map_err(|e| DisplayError::HardwareUnavailable(format!("FBIOPUT_VSCREENINFO: {}", e)))?;
        info!("{} switched to {} bpp", self.path.display(), bits_per_pixel);
        Ok(())
    }

    /// Rotate the panel, 0..=3 in quarter turns as the driver counts them
    pub fn set_rotation(&self, rotate: u32) -> Result<(), DisplayError> {
        if rotate > 3 {
            return Err(DisplayError::InvalidConfiguration(format!("rotation {} out of range 0..=3", rotate)));
        }
        let mut info = self.var_screeninfo()?;
        if info.rotate == rotate {
            return Ok(());
        }
        info.rotate = rotate;
        info.activate = FB_ACTIVATE_FORCE;
        self.put_var_screeninfo(&info)
            .map_err(|e| DisplayError::HardwareUnavailable(format!("FBIOPUT_VSCREENINFO: {}", e)))?;
        info!("{} rotated to {}", self.path.display(), rotate);
        Ok(())
    }

    pub fn geometry(&self) -> Result<FbGeometry, DisplayError> {
        FbGeometry::from_screeninfo(&self.var_screeninfo()?, &self.fix_screeninfo()?)
    }

    pub fn unblank(&self) -> io::Result<()> {
        self.ioctl(FBIOBLANK, FB_BLANK_UNBLANK as *mut libc::c_void)
    }

    /// Map the framebuffer memory. The mapping keeps the device alive.
    pub fn map(self: &Arc<Self>) -> Result<MappedFramebuffer, DisplayError> {
        let geometry = self.geometry()?;
        let map = unsafe { MmapOptions::new().len(geometry.map_len).map_mut(&self.file) }
            .map_err(|e| DisplayError::HardwareUnavailable(format!("mmap {}: {}", self.path.display(), e)))?;
        debug!("mapped {} bytes of {}", geometry.map_len, self.path.display());
        Ok(MappedFramebuffer { map, geometry, _device: Arc::clone(self) })
    }
}

impl Drop for FbDevice {
    fn drop(&mut self) {
        let current = match self.var_screeninfo() {
            Ok(info) => info,
            Err(_) => return,
        };
        if current.bits_per_pixel == self.original.bits_per_pixel && current.rotate == self.original.rotate {
            return;
        }
        let mut original = self.original;
        original.activate = FB_ACTIVATE_FORCE;
        match self.put_var_screeninfo(&original) {
            Ok(()) => info!(
                "restored {} to {} bpp, rotate {}",
                self.path.display(),
                original.bits_per_pixel,
                original.rotate
            ),
            Err(e) => warn!("could not restore screen info on {}: {}", self.path.display(), e),
        }
    }
}

/// The visible framebuffer as a pixel surface
pub struct MappedFramebuffer {
    map: MmapMut,
    geometry: FbGeometry,
    // dropped after the mapping so the restore runs last
    _device: Arc<FbDevice>,
}

impl MappedFramebuffer {
    pub fn geometry(&self) -> &FbGeometry {
        &self.geometry
    }
}

impl PixelSurface for MappedFramebuffer {
    fn width(&self) -> u32 {
        self.geometry.width
    }

    fn height(&self) -> u32 {
        self.geometry.height
    }

    fn stride(&self) -> usize {
        self.geometry.stride
    }

    fn format(&self) -> PixelFormat {
        self.geometry.format
    }

    fn data(&self) -> &[u8] {
        &self.map[self.geometry.origin..]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.map[self.geometry.origin..]
    }
}

/// Update struct layout understood by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateLayout {
    /// Mark 3-6 kernels with the NTX alt buffer
    Ntx,
    /// Mark 7 kernels
    Mark7,
}

/// mxcfb EPDC driver for i.MX based Kobo readers
pub struct MxcfbDriver {
    device: Arc<FbDevice>,
    layout: UpdateLayout,
    capabilities: DriverCapabilities,
}

impl MxcfbDriver {
    pub fn new(device: Arc<FbDevice>, profile: &DeviceProfile) -> Result<Self, DisplayError> {
        if profile.is_sunxi {
            return Err(DisplayError::HardwareUnavailable(format!(
                "{} uses the sunxi disp2 EPDC, see SunxiDriver",
                profile.codename
            )));
        }
        let layout = if profile.mark >= 7 { UpdateLayout::Mark7 } else { UpdateLayout::Ntx };
        info!("mxcfb driver on {} ({:?} update layout)", device.path().display(), layout);

        Ok(Self {
            device,
            layout,
            capabilities: DriverCapabilities {
                name: "mxcfb",
                supports_invert: true,
                supports_completion_wait: profile.has_reliable_completion_wait,
            },
        })
    }
}

fn mxcfb_rect(command: &RefreshCommand) -> MxcfbRect {
    let r = &command.region;
    MxcfbRect {
        top: r.top_left.y.max(0) as u32,
        left: r.top_left.x.max(0) as u32,
        width: r.size.width,
        height: r.size.height,
    }
}

impl EinkDriver for MxcfbDriver {
    fn capabilities(&self) -> &DriverCapabilities {
        &self.capabilities
    }

    fn send_update(&mut self, command: &RefreshCommand) -> Result<(), DisplayError> {
        let update_mode = if command.flashing { UPDATE_MODE_FULL } else { UPDATE_MODE_PARTIAL };
        let flags = if command.inverted { EPDC_FLAG_ENABLE_INVERSION } else { 0 };

        let result = match self.layout {
            UpdateLayout::Mark7 => {
                let mut data = MxcfbUpdateDataV2 {
                    update_region: mxcfb_rect(command),
                    waveform_mode: command.waveform.code(),
                    update_mode,
                    update_marker: command.marker,
                    temp: TEMP_USE_AMBIENT,
                    flags,
                    ..Default::default()
                };
                self.device.ioctl(MXCFB_SEND_UPDATE_V2, &mut data as *mut _ as *mut libc::c_void)
            }
            UpdateLayout::Ntx => {
                let mut data = MxcfbUpdateDataV1Ntx {
                    update_region: mxcfb_rect(command),
                    waveform_mode: command.waveform.code(),
                    update_mode,
                    update_marker: command.marker,
                    temp: TEMP_USE_AMBIENT,
                    flags,
                    ..Default::default()
                };
                self.device.ioctl(MXCFB_SEND_UPDATE_V1_NTX, &mut data as *mut _ as *mut libc::c_void)
            }
        };

        result.map_err(|e| match e.raw_os_error() {
            Some(libc::EPERM) => DisplayError::DisplayFrozen,
            _ => DisplayError::RefreshFailed(format!("MXCFB_SEND_UPDATE: {}", e)),
        })
    }

    fn unblank(&mut self) -> Result<(), DisplayError> {
        self.device
            .unblank()
            .map_err(|e| DisplayError::RefreshFailed(format!("FBIOBLANK: {}", e)))
    }

    fn wait_for_update_complete(&mut self, marker: u32) -> Result<(), DisplayError> {
        let result = match self.layout {
            UpdateLayout::Mark7 => {
                let mut data = MxcfbUpdateMarkerData { update_marker: marker, collision_test: 0 };
                self.device
                    .ioctl(MXCFB_WAIT_FOR_UPDATE_COMPLETE_V3, &mut data as *mut _ as *mut libc::c_void)
            }
            UpdateLayout::Ntx => {
                let mut data = marker;
                self.device
                    .ioctl(MXCFB_WAIT_FOR_UPDATE_COMPLETE_V1, &mut data as *mut _ as *mut libc::c_void)
            }
        };
        result.map_err(|e| DisplayError::RefreshFailed(format!("MXCFB_WAIT_FOR_UPDATE_COMPLETE: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers_match_kernel_headers() {
        assert_eq!(size_of::<MxcfbUpdateDataV2>(), 72);
        assert_eq!(MXCFB_SEND_UPDATE_V2, 0x4048_462E);
        assert_eq!(MXCFB_WAIT_FOR_UPDATE_COMPLETE_V1, 0x4004_462F);
        assert_eq!(MXCFB_WAIT_FOR_UPDATE_COMPLETE_V3, 0xC008_462F);
        assert_eq!(size_of::<FbVarScreeninfo>(), 160);
    }

    fn gray_info() -> (FbVarScreeninfo, FbFixScreeninfo) {
        let var = FbVarScreeninfo {
            xres: 1072,
            yres: 1448,
            xres_virtual: 1088,
            yres_virtual: 2896,
            bits_per_pixel: 8,
            ..Default::default()
        };
        let fix = FbFixScreeninfo { line_length: 1088, smem_len: 1088 * 2896, ..Default::default() };
        (var, fix)
    }

    #[test]
    fn test_geometry_from_screeninfo() {
        let (var, fix) = gray_info();
        let g = FbGeometry::from_screeninfo(&var, &fix).unwrap();
        assert_eq!(g.format, PixelFormat::Gray8);
        assert_eq!((g.width, g.height, g.stride), (1072, 1448, 1088));
        assert_eq!(g.origin, 0);
        assert_eq!(g.physical_mm, None);
    }

    #[test]
    fn test_geometry_honours_pan_offset() {
        let (mut var, fix) = gray_info();
        var.yoffset = 1448;
        let g = FbGeometry::from_screeninfo(&var, &fix).unwrap();
        assert_eq!(g.origin, 1448 * 1088);
    }

    #[test]
    fn test_geometry_rejects_odd_depth() {
        let (mut var, fix) = gray_info();
        var.bits_per_pixel = 4;
        assert!(matches!(
            FbGeometry::from_screeninfo(&var, &fix),
            Err(DisplayError::HardwareUnavailable(_))
        ));
    }

    #[test]
    fn test_32bit_channel_order() {
        let (mut var, mut fix) = gray_info();
        var.bits_per_pixel = 32;
        fix.line_length = 1088 * 4;
        fix.smem_len = 1088 * 4 * 2896;
        var.red.offset = 16;
        assert_eq!(FbGeometry::from_screeninfo(&var, &fix).unwrap().format, PixelFormat::Xrgb8888);
        var.red.offset = 0;
        assert_eq!(FbGeometry::from_screeninfo(&var, &fix).unwrap().format, PixelFormat::Xbgr8888);
    }

    #[test]
    fn test_physical_size_placeholders() {
        let mut var = FbVarScreeninfo::default();
        assert_eq!(physical_size_mm(&var), None);
        var.width = u32::MAX;
        var.height = 120;
        assert_eq!(physical_size_mm(&var), None);
        var.width = 90;
        assert_eq!(physical_size_mm(&var), Some(Size::new(90, 120)));
    }
}
