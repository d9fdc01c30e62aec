/*
 *  display/sunxi.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Allwinner (sunxi) disp2 EPDC backend: the panel scans out an ION
 *  buffer and refreshes go through /dev/disp rather than mxcfb
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
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use embedded_graphics::primitives::Rectangle;
use log::{debug, info, warn};
use memmap2::{MmapMut, MmapOptions};

use crate::display::device::DeviceProfile;
use crate::display::error::DisplayError;
use crate::display::framebuffer::{iowr, FbDevice};
use crate::display::surface::{PixelFormat, PixelSurface};
use crate::display::traits::{DriverCapabilities, EinkDriver, RefreshCommand};
use crate::display::waveform::WaveformId;

pub const DISP_DEVICE: &str = "/dev/disp";
pub const ION_DEVICE: &str = "/dev/ion";

// sunxi_display2.h, plain command numbers
const DISP_EINK_UPDATE2: libc::c_ulong = 0x0406;
const DISP_EINK_WAIT_FRAME_SYNC_COMPLETE: libc::c_ulong = 0x4014;

// enum eink_update_mode
const EINK_INIT_MODE: u32 = 0x01;
const EINK_DU_MODE: u32 = 0x02;
const EINK_GC16_MODE: u32 = 0x04;
const EINK_GC4_MODE: u32 = 0x08;
const EINK_A2_MODE: u32 = 0x10;
const EINK_GL16_MODE: u32 = 0x20;
const EINK_GLR16_MODE: u32 = 0x40;
const EINK_GLD16_MODE: u32 = 0x80;
const EINK_PARTIAL_MODE: u32 = 0x400;
const EINK_AUTO_MODE: u32 = 0x8000;
const EINK_NEGATIVE_MODE: u32 = 0x10000;

const DISP_FORMAT_ARGB_8888: u32 = 0x00;
const LAYER_MODE_BUFFER: u32 = 0;

// legacy ion.h
const ION_HEAP_TYPE_DMA_MASK: u32 = 1 << 4;
const ION_IOC_ALLOC: u32 = iowr(b'I', 0, size_of::<IonAllocationData>());
const ION_IOC_FREE: u32 = iowr(b'I', 1, size_of::<IonHandleData>());
const ION_IOC_MAP: u32 = iowr(b'I', 2, size_of::<IonFdData>());

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IonAllocationData {
    len: usize,
    align: usize,
    heap_id_mask: u32,
    flags: u32,
    handle: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IonFdData {
    handle: i32,
    fd: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IonHandleData {
    handle: i32,
}

/// Inclusive corners, as the EINK engine wants them
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct AreaInfo {
    x_top: u32,
    y_top: u32,
    x_bottom: u32,
    y_bottom: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DispRect {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DispRectSz {
    width: u32,
    height: u32,
}

/// Fixed point, 32 fractional bits
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DispRect64 {
    x: i64,
    y: i64,
    width: i64,
    height: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DispFbInfo2 {
    fd: i32,
    y8_fd: i32,
    size: [DispRectSz; 3],
    align: [u32; 3],
    format: u32,
    color_space: u32,
    trd_right_fd: i32,
    pre_multiply: bool,
    crop: DispRect64,
    flags: u32,
    scan: u32,
    eotf: u32,
    depth: i32,
    fbd_en: u32,
    metadata_fd: i32,
    metadata_size: u32,
    metadata_flag: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DispAtwInfo {
    used: bool,
    mode: u32,
    b_row: u32,
    b_col: u32,
    cof_fd: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DispLayerInfo2 {
    mode: u32,
    zorder: u8,
    alpha_mode: u8,
    alpha_value: u8,
    screen_win: DispRect,
    b_trd_out: bool,
    out_trd_mode: u32,
    // union with a fill colour; only buffer mode is used
    fb: DispFbInfo2,
    id: u32,
    atw: DispAtwInfo,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DispLayerConfig2 {
    info: DispLayerInfo2,
    enable: bool,
    channel: u32,
    layer_id: u32,
}

#[repr(C)]
struct DispEinkUpdate2 {
    area: *const AreaInfo,
    layer_num: libc::c_ulong,
    update_mode: libc::c_ulong,
    lyr_cfg2: *const DispLayerConfig2,
    frame_id: *mut u32,
    rotate: *const u32,
    cfa_use: libc::c_ulong,
}

fn ioctl(file: &File, request: libc::c_ulong, arg: *mut libc::c_void) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
    if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

fn open_rw(path: &Path) -> Result<File, DisplayError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| DisplayError::HardwareUnavailable(format!("{}: {}", path.display(), e)))
}

/// EINK update mode bits for a refresh
fn update_mode(command: &RefreshCommand) -> u32 {
    let mut mode = match command.waveform {
        WaveformId::Init => EINK_INIT_MODE,
        WaveformId::Du => EINK_DU_MODE,
        WaveformId::Gc16 => EINK_GC16_MODE,
        WaveformId::Gc4 => EINK_GC4_MODE,
        WaveformId::A2 => EINK_A2_MODE,
        WaveformId::Gl16 => EINK_GL16_MODE,
        WaveformId::Reagl => EINK_GLR16_MODE,
        WaveformId::Reagld => EINK_GLD16_MODE,
        WaveformId::Auto => EINK_AUTO_MODE,
    };
    if !command.flashing {
        mode |= EINK_PARTIAL_MODE;
    }
    if command.inverted {
        mode |= EINK_NEGATIVE_MODE;
    }
    mode
}

fn area_info(region: &Rectangle) -> AreaInfo {
    let x = region.top_left.x.max(0) as u32;
    let y = region.top_left.y.max(0) as u32;
    AreaInfo {
        x_top: x,
        y_top: y,
        x_bottom: x.saturating_add(region.size.width.max(1) - 1),
        y_bottom: y.saturating_add(region.size.height.max(1) - 1),
    }
}

/// A DMA-capable buffer from the ION allocator, exported as a dma-buf
#[derive(Debug)]
pub struct IonBuffer {
    ion: File,
    handle: i32,
    buffer: File,
    len: usize,
}

impl IonBuffer {
    pub fn allocate(len: usize) -> Result<Self, DisplayError> {
        let ion = open_rw(Path::new(ION_DEVICE))?;

        let mut alloc = IonAllocationData {
            len,
            align: page_size(),
            heap_id_mask: ION_HEAP_TYPE_DMA_MASK,
            ..Default::default()
        };
        ioctl(&ion, ION_IOC_ALLOC as _, &mut alloc as *mut _ as *mut libc::c_void)
            .map_err(|e| DisplayError::HardwareUnavailable(format!("ION_IOC_ALLOC {} bytes: {}", len, e)))?;

        let mut share = IonFdData { handle: alloc.handle, fd: -1 };
        if let Err(e) = ioctl(&ion, ION_IOC_MAP as _, &mut share as *mut _ as *mut libc::c_void) {
            free_handle(&ion, alloc.handle);
            return Err(DisplayError::HardwareUnavailable(format!("ION_IOC_MAP: {}", e)));
        }
        let buffer = File::from(unsafe { OwnedFd::from_raw_fd(share.fd) });
        debug!("ion buffer of {} bytes, dma-buf fd {}", len, share.fd);

        Ok(Self { ion, handle: alloc.handle, buffer, len })
    }

    fn fd(&self) -> i32 {
        self.buffer.as_raw_fd()
    }

    fn map(&self) -> Result<MmapMut, DisplayError> {
        unsafe { MmapOptions::new().len(self.len).map_mut(&self.buffer) }
            .map_err(|e| DisplayError::HardwareUnavailable(format!("mmap ion buffer: {}", e)))
    }
}

fn free_handle(ion: &File, handle: i32) {
    let mut data = IonHandleData { handle };
    if let Err(e) = ioctl(ion, ION_IOC_FREE as _, &mut data as *mut _ as *mut libc::c_void) {
        warn!("ION_IOC_FREE: {}", e);
    }
}

impl Drop for IonBuffer {
    fn drop(&mut self) {
        free_handle(&self.ion, self.handle);
    }
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// The ION scanout buffer as a pixel surface, 32 bpp
pub struct SunxiFramebuffer {
    map: MmapMut,
    width: u32,
    height: u32,
    // after the mapping, so it is unmapped before the handle is freed
    _buffer: Arc<IonBuffer>,
}

impl PixelSurface for SunxiFramebuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn stride(&self) -> usize {
        self.width as usize * PixelFormat::Xrgb8888.bytes_per_pixel()
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::Xrgb8888
    }

    fn data(&self) -> &[u8] {
        &self.map
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

/// disp2 EINK driver for sunxi based Kobo readers
pub struct SunxiDriver {
    disp: File,
    device: Arc<FbDevice>,
    // names the dma-buf fd, which the framebuffer keeps open
    layer: DispLayerConfig2,
    capabilities: DriverCapabilities,
}

impl SunxiDriver {
    /// Allocate the scanout buffer and open /dev/disp. The panel size
    /// comes from the framebuffer node, which is otherwise left alone.
    pub fn open(device: Arc<FbDevice>, profile: &DeviceProfile) -> Result<(Self, SunxiFramebuffer), DisplayError> {
        let var = device.var_screeninfo()?;
        let (width, height) = (var.xres, var.yres);
        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(PixelFormat::Xrgb8888.bytes_per_pixel()))
            .filter(|&n| n > 0)
            .ok_or_else(|| DisplayError::HardwareUnavailable(format!("bad panel size {}x{}", width, height)))?;

        let buffer = Arc::new(IonBuffer::allocate(len)?);
        let map = buffer.map()?;
        let disp = open_rw(Path::new(DISP_DEVICE))?;
        info!("sunxi disp2 driver on {}, {}x{} ion scanout", DISP_DEVICE, width, height);

        let driver = Self {
            disp,
            device,
            layer: scanout_layer(buffer.fd(), width, height),
            capabilities: DriverCapabilities {
                name: "sunxi",
                supports_invert: true,
                supports_completion_wait: profile.has_reliable_completion_wait,
            },
        };
        let framebuffer = SunxiFramebuffer { map, width, height, _buffer: buffer };
        Ok((driver, framebuffer))
    }

    fn submit(&self, command: &RefreshCommand) -> io::Result<()> {
        let area = area_info(&command.region);
        let mut frame_id = command.marker;
        let rotate: u32 = 0;
        let mut update = DispEinkUpdate2 {
            area: &area,
            layer_num: 1,
            update_mode: update_mode(command) as libc::c_ulong,
            lyr_cfg2: &self.layer,
            frame_id: &mut frame_id,
            rotate: &rotate,
            cfa_use: 0,
        };
        ioctl(&self.disp, DISP_EINK_UPDATE2, &mut update as *mut _ as *mut libc::c_void)
    }
}

/// Full-screen ARGB layer reading from the dma-buf `fd`
fn scanout_layer(fd: i32, width: u32, height: u32) -> DispLayerConfig2 {
    let mut layer = DispLayerConfig2 { enable: true, ..Default::default() };
    let info = &mut layer.info;
    info.mode = LAYER_MODE_BUFFER;
    info.alpha_mode = 1;
    info.alpha_value = 0xff;
    info.screen_win = DispRect { x: 0, y: 0, width, height };
    info.fb.fd = fd;
    info.fb.y8_fd = -1;
    info.fb.trd_right_fd = -1;
    info.fb.metadata_fd = -1;
    info.fb.size[0] = DispRectSz { width, height };
    info.fb.format = DISP_FORMAT_ARGB_8888;
    info.fb.crop = DispRect64 { x: 0, y: 0, width: (width as i64) << 32, height: (height as i64) << 32 };
    info.atw.cof_fd = -1;
    layer
}

impl EinkDriver for SunxiDriver {
    fn capabilities(&self) -> &DriverCapabilities {
        &self.capabilities
    }

    fn send_update(&mut self, command: &RefreshCommand) -> Result<(), DisplayError> {
        self.submit(command).map_err(|e| match e.raw_os_error() {
            Some(libc::EPERM) => DisplayError::DisplayFrozen,
            _ => DisplayError::RefreshFailed(format!("DISP_EINK_UPDATE2: {}", e)),
        })
    }

    fn unblank(&mut self) -> Result<(), DisplayError> {
        self.device
            .unblank()
            .map_err(|e| DisplayError::RefreshFailed(format!("FBIOBLANK: {}", e)))
    }

    fn wait_for_update_complete(&mut self, marker: u32) -> Result<(), DisplayError> {
        let mut args: [libc::c_ulong; 4] = [marker as libc::c_ulong, 0, 0, 0];
        ioctl(&self.disp, DISP_EINK_WAIT_FRAME_SYNC_COMPLETE, args.as_mut_ptr() as *mut libc::c_void)
            .map_err(|e| DisplayError::RefreshFailed(format!("DISP_EINK_WAIT_FRAME_SYNC_COMPLETE: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_graphics::prelude::*;

    fn command(waveform: WaveformId, flashing: bool, inverted: bool) -> RefreshCommand {
        RefreshCommand {
            region: Rectangle::new(Point::new(10, 20), Size::new(100, 50)),
            waveform,
            flashing,
            inverted,
            marker: 7,
        }
    }

    #[test]
    fn test_update_mode_bits() {
        assert_eq!(update_mode(&command(WaveformId::Gc16, true, false)), EINK_GC16_MODE);
        assert_eq!(update_mode(&command(WaveformId::Du, false, false)), EINK_DU_MODE | EINK_PARTIAL_MODE);
        assert_eq!(update_mode(&command(WaveformId::Reagl, false, false)), EINK_GLR16_MODE | EINK_PARTIAL_MODE);
        assert_eq!(
            update_mode(&command(WaveformId::Gl16, true, true)),
            EINK_GL16_MODE | EINK_NEGATIVE_MODE
        );
    }

    #[test]
    fn test_area_is_inclusive() {
        let area = area_info(&Rectangle::new(Point::new(10, 20), Size::new(100, 50)));
        assert_eq!(area, AreaInfo { x_top: 10, y_top: 20, x_bottom: 109, y_bottom: 69 });

        let clamped = area_info(&Rectangle::new(Point::new(-5, -5), Size::new(1, 1)));
        assert_eq!(clamped, AreaInfo { x_top: 0, y_top: 0, x_bottom: 0, y_bottom: 0 });
    }

    #[test]
    fn test_scanout_layer_covers_panel() {
        let layer = scanout_layer(9, 1404, 1872);
        assert!(layer.enable);
        assert_eq!(layer.info.fb.fd, 9);
        assert_eq!(layer.info.screen_win.width, 1404);
        assert_eq!(layer.info.fb.crop.height >> 32, 1872);
        assert_eq!(layer.info.fb.format, DISP_FORMAT_ARGB_8888);
    }

    #[test]
    fn test_ion_ioctl_numbers() {
        assert_eq!(ION_IOC_MAP, 0xC008_4902);
        assert_eq!(ION_IOC_FREE, 0xC004_4901);
    }
}
