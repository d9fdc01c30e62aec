/*
 *  display/dither.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Ordered dithering into a shadow copy of the compositor surface
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

use embedded_graphics::primitives::Rectangle;
use log::debug;

use crate::display::surface::{PixelSurface, SurfaceBuffer};

/// Classic 8x8 Bayer threshold map, values 0..63
const BAYER_8X8: [[u8; 8]; 8] = [
    [0, 32, 8, 40, 2, 34, 10, 42],
    [48, 16, 56, 24, 50, 18, 58, 26],
    [12, 44, 4, 36, 14, 46, 6, 38],
    [60, 28, 52, 20, 62, 30, 54, 22],
    [3, 35, 11, 43, 1, 33, 9, 41],
    [51, 19, 59, 27, 49, 17, 57, 25],
    [15, 47, 7, 39, 13, 45, 5, 37],
    [63, 31, 55, 23, 61, 29, 53, 21],
];

/// Gray levels the panel can show
const PANEL_LEVELS: u32 = 16;

/// Quantise one pixel to the panel's gray levels using the threshold at (x, y)
#[inline]
pub fn dither_pixel(gray: u8, x: u32, y: u32) -> u8 {
    let steps = PANEL_LEVELS - 1;
    let scaled = gray as u32 * steps;
    let mut level = scaled / 255;
    let remainder = scaled % 255;
    let threshold = (BAYER_8X8[(y & 7) as usize][(x & 7) as usize] as u32 * 255 + 127) / 64;
    if remainder > threshold {
        level += 1;
    }
    (level * 255 / steps) as u8
}

/// Software dithering state and its shadow buffer
#[derive(Debug, Default)]
pub struct Ditherer {
    software: bool,
    hardware: bool,
    shadow: Option<SurfaceBuffer>,
}

impl Ditherer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store both flags. Turning software dithering on clones `source`
    /// into the shadow when one is given, otherwise the next
    /// `dither_region` call does it.
    pub fn enable(&mut self, software: bool, hardware: bool, source: Option<&dyn PixelSurface>) {
        let newly_on = software && !self.software;
        self.software = software;
        self.hardware = hardware;

        if !software {
            self.shadow = None;
        } else if newly_on {
            self.shadow = source.map(SurfaceBuffer::clone_from_surface);
        }
        debug!("dithering: software {} hardware {}", software, hardware);
    }

    pub fn software_enabled(&self) -> bool {
        self.software
    }

    /// Inert, kept for callers that ask
    pub fn hardware_enabled(&self) -> bool {
        self.hardware
    }

    pub fn shadow(&self) -> Option<&SurfaceBuffer> {
        self.shadow.as_ref()
    }

    /// Dither the rows spanned by `region` from `source` into the shadow
    pub fn dither_region(&mut self, source: &dyn PixelSurface, region: &Rectangle) {
        let stale = !matches!(&self.shadow, Some(shadow) if shadow.shares_geometry_with(source));
        if stale {
            debug!(
                "dither shadow does not match {}x{} source, recloning",
                source.width(),
                source.height()
            );
            self.shadow = Some(SurfaceBuffer::clone_from_surface(source));
        }
        let Some(shadow) = self.shadow.as_mut() else {
            return;
        };

        let top = region.top_left.y.max(0) as u32;
        let bottom = (region.top_left.y.max(0) as u32)
            .saturating_add(region.size.height)
            .min(source.height());
        let format = source.format();
        let bpp = format.bytes_per_pixel();
        let width = source.width();

        for y in top..bottom {
            let src_row = y as usize * source.stride();
            let dst_row = y as usize * shadow.stride();
            for x in 0..width {
                let at = x as usize * bpp;
                let gray = format.luma(&source.data()[src_row + at..src_row + at + bpp]);
                let out = dither_pixel(gray, x, y);
                format.store_gray(&mut shadow.data_mut()[dst_row + at..dst_row + at + bpp], out);
            }
        }
    }

    /// Surface to copy pixels from: the shadow while software dithering
    /// is on, else the source itself
    pub fn blit_source<'a>(&'a self, source: &'a dyn PixelSurface) -> &'a dyn PixelSurface {
        match (&self.shadow, self.software) {
            (Some(shadow), true) if shadow.shares_geometry_with(source) => shadow,
            _ => source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::surface::PixelFormat;
    use embedded_graphics::prelude::*;

    fn rect(x: i32, y: i32, w: u32, h: u32) -> Rectangle {
        Rectangle::new(Point::new(x, y), Size::new(w, h))
    }

    #[test]
    fn test_panel_levels_are_fixed_points() {
        for level in 0..16u32 {
            let gray = (level * 17) as u8;
            for (x, y) in [(0, 0), (3, 5), (7, 7)] {
                assert_eq!(dither_pixel(gray, x, y), gray);
            }
        }
    }

    #[test]
    fn test_mid_gray_mixes_neighbouring_levels() {
        let gray = 17 * 7 + 8;
        let mut seen = std::collections::BTreeSet::new();
        for y in 0..8 {
            for x in 0..8 {
                seen.insert(dither_pixel(gray, x, y));
            }
        }
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![17 * 7, 17 * 8]);
    }

    #[test]
    fn test_shadow_reallocated_on_size_mismatch() {
        let mut d = Ditherer::new();
        let small = SurfaceBuffer::new(10, 10, PixelFormat::Gray8);
        d.enable(true, false, Some(&small));
        assert_eq!(d.shadow().map(|s| s.dimensions()), Some(Size::new(10, 10)));

        let big = SurfaceBuffer::new(20, 30, PixelFormat::Gray8);
        d.dither_region(&big, &rect(0, 0, 20, 5));
        assert_eq!(d.shadow().map(|s| s.dimensions()), Some(Size::new(20, 30)));
    }

    #[test]
    fn test_only_region_rows_written() {
        let mut source = SurfaceBuffer::new(16, 16, PixelFormat::Gray8);
        let all = source.bounds();
        source.fill_gray(&all, 100);
        let mut d = Ditherer::new();
        d.enable(true, false, Some(&source));

        d.dither_region(&source, &rect(4, 4, 2, 2));

        let shadow = d.shadow().unwrap();
        // rows outside the region keep the cloned value
        assert_eq!(shadow.gray_at(0, 3), Some(100));
        assert_eq!(shadow.gray_at(0, 6), Some(100));
        // the whole of rows 4 and 5 is quantised
        for x in 0..16 {
            assert_eq!(shadow.gray_at(x, 4).unwrap() % 17, 0);
            assert_eq!(shadow.gray_at(x, 5).unwrap() % 17, 0);
        }
        // source untouched
        assert_eq!(source.gray_at(4, 4), Some(100));
    }

    #[test]
    fn test_lazy_clone_and_blit_source() {
        let source = SurfaceBuffer::new(8, 8, PixelFormat::Gray8);
        let mut d = Ditherer::new();
        d.enable(true, true, None);
        assert!(d.hardware_enabled());
        assert!(d.shadow().is_none());
        let picked: *const dyn PixelSurface = d.blit_source(&source);
        assert!(std::ptr::addr_eq(picked, &source as *const SurfaceBuffer));

        d.dither_region(&source, &rect(0, 0, 8, 8));
        assert!(d.shadow().is_some());

        d.enable(false, false, None);
        assert!(d.shadow().is_none());
    }
}
