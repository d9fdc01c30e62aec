/*
 *  display/cursor.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Adaptive cursor refresh: fast low-fidelity updates while the pointer
 *  moves, one clean standby update once it stops
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
use std::path::Path;
use std::time::Duration;

use embedded_graphics::pixelcolor::{Gray8, GrayColor};
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Line, PrimitiveStyle, PrimitiveStyleBuilder, Rectangle, Triangle};
use image::{DynamicImage, LumaA};
use log::{debug, info};

use crate::display::error::DisplayError;
use crate::display::region::{clip, union};
use crate::display::surface::{PixelSurface, SurfaceBuffer};
use crate::display::waveform::{WaveformId, WaveformSet};

pub const DEFAULT_SLOW_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_FAST_INTERVAL: Duration = Duration::from_millis(125);
pub const DEFAULT_CYCLES_UNTIL_SLOW: u32 = 1;
pub const FALLBACK_CURSOR_SIZE: u32 = 48;

/// Built-in arrow height
const ARROW_HEIGHT: u32 = 32;

/// Largest standby image side accepted
pub const MAX_SPRITE_SIDE: u32 = 256;

const OPAQUE_ALPHA: u8 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorConfig {
    pub slow_interval: Duration,
    pub fast_interval: Duration,
    /// Unchanged ticks before the standby cursor is drawn
    pub cycles_until_slow: u32,
    /// Cursor box side when nothing better is known
    pub fallback_size: u32,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            slow_interval: DEFAULT_SLOW_INTERVAL,
            fast_interval: DEFAULT_FAST_INTERVAL,
            cycles_until_slow: DEFAULT_CYCLES_UNTIL_SLOW,
            fallback_size: FALLBACK_CURSOR_SIZE,
        }
    }
}

/// Timer cadence; Slow while idle, Fast while moving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Slow,
    Fast,
}

/// A small image with transparent pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSprite {
    size: Size,
    pixels: Vec<Option<u8>>,
}

impl CursorSprite {
    /// Fully transparent sprite
    pub fn new(size: Size) -> Self {
        Self { size, pixels: vec![None; (size.width * size.height) as usize] }
    }

    /// Solid black pointer with a white rim, tip at the origin
    pub fn arrow() -> Self {
        Self::arrow_styled(Gray8::BLACK, Gray8::WHITE)
    }

    /// Hollow pointer shown once the cursor has stopped
    pub fn standby_arrow() -> Self {
        Self::arrow_styled(Gray8::WHITE, Gray8::BLACK)
    }

    fn arrow_styled(fill: Gray8, rim: Gray8) -> Self {
        let h = ARROW_HEIGHT as i32;
        let mut sprite = Self::new(Size::new(ARROW_HEIGHT * 3 / 4, ARROW_HEIGHT));

        let _ = Line::new(Point::new(h / 4, h / 2), Point::new(h / 2 - 2, h - 3))
            .into_styled(PrimitiveStyle::with_stroke(rim, 7))
            .draw(&mut sprite);
        let _ = Line::new(Point::new(h / 4, h / 2), Point::new(h / 2 - 2, h - 3))
            .into_styled(PrimitiveStyle::with_stroke(fill, 3))
            .draw(&mut sprite);
        let _ = Triangle::new(Point::new(1, 1), Point::new(1, h * 3 / 4), Point::new(h * 5 / 8, h * 5 / 8))
            .into_styled(PrimitiveStyleBuilder::new().fill_color(fill).stroke_color(rim).stroke_width(1).build())
            .draw(&mut sprite);
        sprite
    }

    /// Sprite from a decoded image. Pixels with alpha below half are
    /// transparent.
    pub fn from_image(image: &DynamicImage) -> Result<Self, DisplayError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 || width > MAX_SPRITE_SIDE || height > MAX_SPRITE_SIDE {
            return Err(DisplayError::InvalidConfiguration(format!(
                "standby image is {}x{}, sides must be 1..={}",
                width, height, MAX_SPRITE_SIDE
            )));
        }
        let pixels = image
            .to_luma_alpha8()
            .pixels()
            .map(|&LumaA([luma, alpha])| (alpha >= OPAQUE_ALPHA).then_some(luma))
            .collect();
        Ok(Self { size: Size::new(width, height), pixels })
    }

    /// Sprite from encoded bytes in any supported format (PNG, PNM)
    pub fn from_memory(bytes: &[u8]) -> Result<Self, DisplayError> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| DisplayError::InvalidConfiguration(format!("standby image: {}", e)))?;
        Self::from_image(&image)
    }

    pub fn load(path: &Path) -> Result<Self, DisplayError> {
        let image = image::open(path).map_err(|e| {
            DisplayError::InvalidConfiguration(format!("standby image {}: {}", path.display(), e))
        })?;
        let sprite = Self::from_image(&image)?;
        info!("standby cursor {}x{} from {}", sprite.size.width, sprite.size.height, path.display());
        Ok(sprite)
    }

    /// Same shape with every gray level inverted
    pub fn inverted(&self) -> Self {
        Self { size: self.size, pixels: self.pixels.iter().map(|p| p.map(|v| !v)).collect() }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.size.width || y >= self.size.height {
            return None;
        }
        self.pixels[(y * self.size.width + x) as usize]
    }

    /// Paint the opaque pixels with the sprite's origin at `at`
    pub fn draw_onto(&self, target: &mut dyn PixelSurface, at: Point) {
        for y in 0..self.size.height {
            for x in 0..self.size.width {
                let (tx, ty) = (at.x + x as i32, at.y + y as i32);
                if tx < 0 || ty < 0 {
                    continue;
                }
                if let Some(v) = self.pixel(x, y) {
                    target.set_gray(tx as u32, ty as u32, v);
                }
            }
        }
    }
}

impl OriginDimensions for CursorSprite {
    fn size(&self) -> Size {
        self.size
    }
}

impl DrawTarget for CursorSprite {
    type Color = Gray8;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(p, c) in pixels {
            if p.x >= 0 && p.y >= 0 && (p.x as u32) < self.size.width && (p.y as u32) < self.size.height {
                let idx = (p.y as u32 * self.size.width + p.x as u32) as usize;
                self.pixels[idx] = Some(c.luma());
            }
        }
        Ok(())
    }
}

/// What the state machine needs from the engine during a tick
pub trait CursorCanvas {
    /// Waveforms in effect right now
    fn waveforms(&self) -> WaveformSet;

    /// Clean pixels under `area` (dither shadow or source)
    fn capture(&self, area: &Rectangle) -> SurfaceBuffer;

    /// Put a captured fragment back into the framebuffer at `at`
    fn restore(&mut self, fragment: &SurfaceBuffer, at: Point);

    /// Copy clean pixels of `area` back into the framebuffer
    fn restore_from_source(&mut self, area: &Rectangle);

    fn draw_sprite(&mut self, sprite: &CursorSprite, at: Point);

    fn refresh(&mut self, area: Rectangle, forced: Option<WaveformId>, wait: bool);
}

/// Cursor refresh state.
///
/// Idle (slow cadence) until the pointer moves, Moving (fast cadence)
/// until it has stayed put for `cycles_until_slow` ticks.
#[derive(Debug)]
pub struct CursorRefreshStateMachine {
    config: CursorConfig,
    cursor: CursorSprite,
    standby: CursorSprite,
    position: Point,
    deferred: Vec<Rectangle>,
    cadence: Cadence,
    idle_cycles: u32,
    stop_rect: Rectangle,
    clean_fragment: Option<SurfaceBuffer>,
    /// Where a cursor image currently sits in the framebuffer
    drawn: Option<Rectangle>,
    /// Set while the tick itself paints, so its own writes are not deferred
    rendering: bool,
}

impl CursorRefreshStateMachine {
    pub fn new(config: CursorConfig, initial_position: Point) -> Self {
        Self {
            config,
            cursor: CursorSprite::arrow(),
            standby: CursorSprite::standby_arrow(),
            position: initial_position,
            deferred: Vec::new(),
            cadence: Cadence::Slow,
            idle_cycles: 0,
            stop_rect: Rectangle::zero(),
            clean_fragment: None,
            drawn: None,
            rendering: false,
        }
    }

    pub fn with_standby_sprite(mut self, sprite: CursorSprite) -> Self {
        self.standby = sprite;
        self
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn idle_cycles(&self) -> u32 {
        self.idle_cycles
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn stop_rect(&self) -> Rectangle {
        self.stop_rect
    }

    /// Cursor rectangle the compositor must not paint over
    pub fn dirty_rect(&self) -> Option<Rectangle> {
        self.drawn
    }

    pub fn deferred(&self) -> &[Rectangle] {
        &self.deferred
    }

    pub fn interval(&self, cadence: Cadence) -> Duration {
        match cadence {
            Cadence::Slow => self.config.slow_interval,
            Cadence::Fast => self.config.fast_interval,
        }
    }

    /// Called by the redraw path for each damage rectangle. Returns true
    /// when the rectangle is the cursor's own and was pushed onto the
    /// deferred stack instead of being blitted.
    pub fn defer_if_cursor(&mut self, rect: &Rectangle) -> bool {
        if self.rendering || self.drawn != Some(*rect) {
            return false;
        }
        self.deferred.push(*rect);
        true
    }

    fn box_size(&self) -> Size {
        let fallback = self.config.fallback_size;
        let known = match self.deferred.last() {
            Some(r) => Size::new(
                if r.size.width == 0 { fallback } else { r.size.width },
                if r.size.height == 0 { fallback } else { r.size.height },
            ),
            None => Size::new(fallback, fallback),
        };
        known.component_max(self.cursor.size())
    }

    /// One timer tick with a freshly sampled pointer position. Returns the
    /// cadence for the next interval.
    pub fn tick(&mut self, position: Point, canvas: &mut dyn CursorCanvas) -> Cadence {
        let waveforms = canvas.waveforms();

        if position != self.position {
            self.rendering = true;

            if self.cadence == Cadence::Slow {
                // clean whatever was left at the last stop
                if !self.stop_rect.is_zero_sized() {
                    debug!("cursor woke, cleaning {:?}", self.stop_rect);
                    if let Some(fragment) = &self.clean_fragment {
                        canvas.restore(fragment, self.stop_rect.top_left);
                    }
                    canvas.refresh(self.stop_rect, Some(waveforms.partial), true);
                }
                self.drawn = None;
            }

            // the previous moving cursor goes first so the new one stays on top
            let vacated = self.drawn.take();
            if let (Some(_), Some(fragment)) = (vacated, &self.clean_fragment) {
                canvas.restore(fragment, self.stop_rect.top_left);
            }

            let size = self.box_size();
            self.stop_rect = Rectangle::new(position, size);
            self.clean_fragment = Some(canvas.capture(&self.stop_rect));

            canvas.draw_sprite(&self.cursor, position);
            self.drawn = Some(self.stop_rect);
            canvas.refresh(self.stop_rect, Some(waveforms.fast), false);

            if let Some(old) = vacated {
                canvas.refresh(old, None, false);
            }

            let mut overlapped = false;
            for rect in self.deferred.drain(..) {
                canvas.restore_from_source(&rect);
                overlapped |= !clip(&rect, &self.stop_rect).is_zero_sized();
                canvas.refresh(rect, None, false);
            }
            if overlapped {
                canvas.draw_sprite(&self.cursor, position);
            }

            self.idle_cycles = 0;
            if self.cadence == Cadence::Slow {
                debug!("cursor moving, fast refresh");
                self.cadence = Cadence::Fast;
            }
            self.position = position;
            self.rendering = false;
            return self.cadence;
        }

        match self.cadence {
            Cadence::Fast => {
                self.idle_cycles += 1;
                if self.idle_cycles >= self.config.cycles_until_slow {
                    self.enter_standby(canvas, &waveforms);
                }
            }
            Cadence::Slow => {
                self.idle_cycles = self.idle_cycles.saturating_add(1);
            }
        }
        self.cadence
    }

    fn enter_standby(&mut self, canvas: &mut dyn CursorCanvas, waveforms: &WaveformSet) {
        self.rendering = true;

        if let Some(fragment) = &self.clean_fragment {
            canvas.restore(fragment, self.stop_rect.top_left);
        }
        let standby_rect = Rectangle::new(self.position, self.standby.size());
        // cover both cursor images so the next wake cleans everything
        let covered = union(&self.stop_rect, &standby_rect);
        if covered != self.stop_rect {
            self.stop_rect = covered;
            self.clean_fragment = Some(canvas.capture(&covered));
        }

        canvas.draw_sprite(&self.standby, self.position);
        self.drawn = Some(self.stop_rect);
        canvas.refresh(self.stop_rect, Some(waveforms.partial), false);
        debug!("cursor stopped at {:?}, standby drawn", self.position);

        self.idle_cycles = 0;
        self.cadence = Cadence::Slow;
        self.rendering = false;
    }
}
