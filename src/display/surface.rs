/*
 *  display/surface.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Pixel surfaces: the compositor's rendered image, the dither shadow and
 *  the mapped framebuffer all look the same to the engine
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

use core::convert::Infallible;

use embedded_graphics::geometry::{OriginDimensions, Size};
use embedded_graphics::pixelcolor::{Gray8, GrayColor};
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::Rectangle;

use crate::display::region::clip;

/// Pixel layouts found on Kobo framebuffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit grayscale, the usual e-ink layout
    Gray8,
    /// 16-bit, older boards booted by the stock firmware
    Rgb565,
    /// 32-bit, red at bit 16
    Xrgb8888,
    /// 32-bit, red at bit 0 (Kaleido colour panels)
    Xbgr8888,
    /// 24-bit, red first in memory order b,g,r
    Rgb888,
    /// 24-bit, blue first in memory order r,g,b
    Bgr888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgb888 | PixelFormat::Bgr888 => 3,
            PixelFormat::Xrgb8888 | PixelFormat::Xbgr8888 => 4,
        }
    }

    /// Reduce one pixel to its luma
    #[inline]
    pub fn luma(self, px: &[u8]) -> u8 {
        let (r, g, b) = match self {
            PixelFormat::Gray8 => return px[0],
            PixelFormat::Rgb565 => {
                let v = u16::from_le_bytes([px[0], px[1]]) as u32;
                (
                    (((v >> 11) & 0x1F) * 255 / 31) as u8,
                    (((v >> 5) & 0x3F) * 255 / 63) as u8,
                    ((v & 0x1F) * 255 / 31) as u8,
                )
            }
            // little endian: xrgb is stored b,g,r,x
            PixelFormat::Xrgb8888 | PixelFormat::Rgb888 => (px[2], px[1], px[0]),
            PixelFormat::Xbgr8888 | PixelFormat::Bgr888 => (px[0], px[1], px[2]),
        };
        ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
    }

    /// Write a gray value into one pixel
    #[inline]
    pub fn store_gray(self, px: &mut [u8], value: u8) {
        match self {
            PixelFormat::Gray8 => px[0] = value,
            PixelFormat::Rgb565 => {
                let v = ((value as u16 >> 3) << 11) | ((value as u16 >> 2) << 5) | (value as u16 >> 3);
                px[..2].copy_from_slice(&v.to_le_bytes());
            }
            PixelFormat::Rgb888 | PixelFormat::Bgr888 => px[..3].fill(value),
            PixelFormat::Xrgb8888 | PixelFormat::Xbgr8888 => {
                px[..3].fill(value);
                px[3] = 0xFF;
            }
        }
    }
}

/// Anything the engine can read or write pixels through.
///
/// Rows are `stride()` bytes apart; `data()` covers at least
/// `stride() * height()` bytes.
pub trait PixelSurface {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn stride(&self) -> usize;
    fn format(&self) -> PixelFormat;
    fn data(&self) -> &[u8];
    fn data_mut(&mut self) -> &mut [u8];

    fn dimensions(&self) -> Size {
        Size::new(self.width(), self.height())
    }

    fn bounds(&self) -> Rectangle {
        Rectangle::new(Point::zero(), self.dimensions())
    }

    /// Byte offset of (x, y); caller guarantees bounds
    #[inline]
    fn offset_of(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride() + x as usize * self.format().bytes_per_pixel()
    }

    fn gray_at(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width() || y >= self.height() {
            return None;
        }
        let off = self.offset_of(x, y);
        let bpp = self.format().bytes_per_pixel();
        Some(self.format().luma(&self.data()[off..off + bpp]))
    }

    fn set_gray(&mut self, x: u32, y: u32, value: u8) {
        if x >= self.width() || y >= self.height() {
            return;
        }
        let off = self.offset_of(x, y);
        let bpp = self.format().bytes_per_pixel();
        let format = self.format();
        format.store_gray(&mut self.data_mut()[off..off + bpp], value);
    }

    fn fill_gray(&mut self, area: &Rectangle, value: u8) {
        let area = clip(area, &self.bounds());
        if area.is_zero_sized() {
            return;
        }
        let x0 = area.top_left.x as u32;
        let y0 = area.top_left.y as u32;
        for y in y0..y0 + area.size.height {
            for x in x0..x0 + area.size.width {
                self.set_gray(x, y, value);
            }
        }
    }
}

/// Heap-backed surface. Used for the compositor image, the dither shadow
/// and clean fragments saved from under the cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
}

impl SurfaceBuffer {
    /// New surface filled white
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = width as usize * format.bytes_per_pixel();
        Self {
            data: vec![0xFF; stride * height as usize],
            width,
            height,
            stride,
            format,
        }
    }

    /// Full copy of another surface, keeping its format and row padding
    pub fn clone_from_surface(src: &dyn PixelSurface) -> Self {
        let len = src.stride() * src.height() as usize;
        Self {
            data: src.data()[..len].to_vec(),
            width: src.width(),
            height: src.height(),
            stride: src.stride(),
            format: src.format(),
        }
    }

    /// Copy of `area` (clipped to this surface) as a standalone surface
    pub fn crop(src: &dyn PixelSurface, area: &Rectangle) -> Self {
        let area = clip(area, &src.bounds());
        let mut out = SurfaceBuffer::new(area.size.width, area.size.height, src.format());
        copy_rect(src, &area, &mut out, Point::zero());
        out
    }

    pub fn shares_geometry_with(&self, other: &dyn PixelSurface) -> bool {
        self.width == other.width()
            && self.height == other.height()
            && self.stride == other.stride()
            && self.format == other.format()
    }
}

impl PixelSurface for SurfaceBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl OriginDimensions for SurfaceBuffer {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for SurfaceBuffer {
    type Color = Gray8;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(p, c) in pixels {
            if p.x >= 0 && p.y >= 0 {
                self.set_gray(p.x as u32, p.y as u32, c.luma());
            }
        }
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, color: Self::Color) -> Result<(), Self::Error> {
        self.fill_gray(area, color.luma());
        Ok(())
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        let bounds = self.bounds();
        self.fill_gray(&bounds, color.luma());
        Ok(())
    }
}

/// Copy `src_area` of `src` to `dst` with its top-left at `dst_origin`.
///
/// Both ends are clipped. Same-format copies move whole rows; otherwise
/// pixels pass through gray.
pub fn copy_rect(src: &dyn PixelSurface, src_area: &Rectangle, dst: &mut dyn PixelSurface, dst_origin: Point) {
    let area = clip(src_area, &src.bounds());
    if area.is_zero_sized() {
        return;
    }
    // shift the destination by however much the source clip moved the origin
    let shift = |to: i32, from: i32, by: i32| {
        (by as i64 + to as i64 - from as i64).clamp(i32::MIN as i64, i32::MAX as i64) as i32
    };
    let dst_origin = Point::new(
        shift(area.top_left.x, src_area.top_left.x, dst_origin.x),
        shift(area.top_left.y, src_area.top_left.y, dst_origin.y),
    );
    let target = clip(&Rectangle::new(dst_origin, area.size), &dst.bounds());
    if target.is_zero_sized() {
        return;
    }
    let src_x = (area.top_left.x as i64 + target.top_left.x as i64 - dst_origin.x as i64) as u32;
    let src_y = (area.top_left.y as i64 + target.top_left.y as i64 - dst_origin.y as i64) as u32;
    let dst_x = target.top_left.x as u32;
    let dst_y = target.top_left.y as u32;
    let (w, h) = (target.size.width, target.size.height);

    if src.format() == dst.format() {
        let row_bytes = w as usize * src.format().bytes_per_pixel();
        for row in 0..h {
            let s = src.offset_of(src_x, src_y + row);
            let d = dst.offset_of(dst_x, dst_y + row);
            dst.data_mut()[d..d + row_bytes].copy_from_slice(&src.data()[s..s + row_bytes]);
        }
    } else {
        for row in 0..h {
            for col in 0..w {
                if let Some(g) = src.gray_at(src_x + col, src_y + row) {
                    dst.set_gray(dst_x + col, dst_y + row, g);
                }
            }
        }
    }
}

/// Copy `area` between two surfaces at the same position
pub fn blit(src: &dyn PixelSurface, dst: &mut dyn PixelSurface, area: &Rectangle) {
    copy_rect(src, area, dst, area.top_left);
}

/// Invert the gray level of every pixel in `area`
pub fn invert(surface: &mut dyn PixelSurface, area: &Rectangle) {
    let area = clip(area, &surface.bounds());
    let (x0, y0) = (area.top_left.x as u32, area.top_left.y as u32);
    for y in y0..y0 + area.size.height {
        for x in x0..x0 + area.size.width {
            if let Some(g) = surface.gray_at(x, y) {
                surface.set_gray(x, y, !g);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_graphics::primitives::{PrimitiveStyle, Line};

    #[test]
    fn test_new_surface_is_white() {
        let s = SurfaceBuffer::new(4, 3, PixelFormat::Gray8);
        assert_eq!(s.data().len(), 12);
        assert!(s.data().iter().all(|&b| b == 0xFF));
        assert_eq!(s.gray_at(3, 2), Some(0xFF));
        assert_eq!(s.gray_at(4, 0), None);
    }

    #[test]
    fn test_luma_for_32bit_formats() {
        // pure red in xrgb memory order (b, g, r, x)
        assert_eq!(PixelFormat::Xrgb8888.luma(&[0, 0, 255, 0]), 76);
        assert_eq!(PixelFormat::Xbgr8888.luma(&[255, 0, 0, 0]), 76);
        let mut px = [0u8; 4];
        PixelFormat::Xrgb8888.store_gray(&mut px, 0x40);
        assert_eq!(px, [0x40, 0x40, 0x40, 0xFF]);

        let mut px = [0u8; 2];
        PixelFormat::Rgb565.store_gray(&mut px, 0xFF);
        assert_eq!(px, [0xFF, 0xFF]);
        assert_eq!(PixelFormat::Rgb565.luma(&px), 0xFF);
    }

    #[test]
    fn test_draw_target_line() {
        let mut s = SurfaceBuffer::new(16, 16, PixelFormat::Gray8);
        Line::new(Point::new(0, 0), Point::new(5, 0))
            .into_styled(PrimitiveStyle::with_stroke(Gray8::BLACK, 1))
            .draw(&mut s)
            .unwrap();
        assert_eq!(s.gray_at(0, 0), Some(0));
        assert_eq!(s.gray_at(5, 0), Some(0));
        assert_eq!(s.gray_at(6, 0), Some(0xFF));
    }

    #[test]
    fn test_blit_clips_to_both_surfaces() {
        let mut src = SurfaceBuffer::new(8, 8, PixelFormat::Gray8);
        src.fill_gray(&Rectangle::new(Point::zero(), Size::new(8, 8)), 0x10);
        let mut dst = SurfaceBuffer::new(4, 4, PixelFormat::Gray8);

        blit(&src, &mut dst, &Rectangle::new(Point::new(2, 2), Size::new(6, 6)));

        assert_eq!(dst.gray_at(1, 1), Some(0xFF));
        assert_eq!(dst.gray_at(2, 2), Some(0x10));
        assert_eq!(dst.gray_at(3, 3), Some(0x10));
    }

    #[test]
    fn test_copy_rect_between_formats() {
        let mut src = SurfaceBuffer::new(4, 4, PixelFormat::Xrgb8888);
        src.fill_gray(&Rectangle::new(Point::new(1, 1), Size::new(2, 2)), 0x80);
        let mut dst = SurfaceBuffer::new(4, 4, PixelFormat::Gray8);

        copy_rect(&src, &Rectangle::new(Point::new(1, 1), Size::new(2, 2)), &mut dst, Point::new(0, 0));

        assert_eq!(dst.gray_at(0, 0), Some(0x80));
        assert_eq!(dst.gray_at(1, 1), Some(0x80));
        assert_eq!(dst.gray_at(2, 2), Some(0xFF));
    }

    #[test]
    fn test_crop_keeps_pixels() {
        let mut src = SurfaceBuffer::new(10, 10, PixelFormat::Gray8);
        src.set_gray(5, 5, 0);
        let frag = SurfaceBuffer::crop(&src, &Rectangle::new(Point::new(4, 4), Size::new(3, 3)));
        assert_eq!(frag.dimensions(), Size::new(3, 3));
        assert_eq!(frag.gray_at(1, 1), Some(0));
        assert_eq!(frag.gray_at(0, 0), Some(0xFF));
    }
}
