/*
 *  display/region.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Damage region classification and waveform selection
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

use crate::display::waveform::{WaveformId, WaveformSet};

/// A region this close to the screen edges counts as full screen
pub const FULLSCREEN_TOLERANCE: u32 = 80;
/// Both sides under this are a small update
pub const SMALL_SIDE_MAX: u32 = 60;
/// Or the sides summed under this
pub const SMALL_PERIMETER_MAX: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionClass {
    Full,
    Small,
    Partial,
}

impl RegionClass {
    pub fn classify(region: &Rectangle, screen: Size) -> Self {
        let (w, h) = (region.size.width, region.size.height);

        if w >= screen.width.saturating_sub(FULLSCREEN_TOLERANCE)
            && h >= screen.height.saturating_sub(FULLSCREEN_TOLERANCE)
        {
            RegionClass::Full
        } else if (w < SMALL_SIDE_MAX && h < SMALL_SIDE_MAX) || w.saturating_add(h) < SMALL_PERIMETER_MAX {
            RegionClass::Small
        } else {
            RegionClass::Partial
        }
    }

    /// Waveform for this class; a forced waveform always wins
    pub fn select(self, set: &WaveformSet, forced: Option<WaveformId>) -> WaveformId {
        if let Some(w) = forced {
            return w;
        }
        match self {
            RegionClass::Full => set.fullscreen,
            RegionClass::Small => set.fast,
            RegionClass::Partial => set.partial,
        }
    }
}

/// Exclusive right and bottom edges, without overflow
fn edges(r: &Rectangle) -> (i64, i64) {
    (
        r.top_left.x as i64 + r.size.width as i64,
        r.top_left.y as i64 + r.size.height as i64,
    )
}

fn span(from: i64, to: i64) -> u32 {
    (to - from).clamp(0, u32::MAX as i64) as u32
}

/// Smallest rectangle covering both; zero-sized inputs are ignored
pub fn union(a: &Rectangle, b: &Rectangle) -> Rectangle {
    if a.is_zero_sized() {
        return *b;
    }
    if b.is_zero_sized() {
        return *a;
    }
    let left = a.top_left.x.min(b.top_left.x);
    let top = a.top_left.y.min(b.top_left.y);
    let (ar, ab) = edges(a);
    let (br, bb) = edges(b);
    Rectangle::new(
        Point::new(left, top),
        Size::new(span(left as i64, ar.max(br)), span(top as i64, ab.max(bb))),
    )
}

/// The part of `region` inside `bounds`, zero-sized when they miss
pub fn clip(region: &Rectangle, bounds: &Rectangle) -> Rectangle {
    let left = region.top_left.x.max(bounds.top_left.x);
    let top = region.top_left.y.max(bounds.top_left.y);
    let (rr, rb) = edges(region);
    let (br, bb) = edges(bounds);
    let (width, height) = (span(left as i64, rr.min(br)), span(top as i64, rb.min(bb)));
    if width == 0 || height == 0 {
        return Rectangle::zero();
    }
    Rectangle::new(Point::new(left, top), Size::new(width, height))
}

/// Union of a damage list, zero-sized when the list is empty
pub fn bounding_union(rects: &[Rectangle]) -> Rectangle {
    rects.iter().fold(Rectangle::zero(), |acc, r| union(&acc, r))
}
