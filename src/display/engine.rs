/*
 *  display/engine.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  The engine: one context object owning the refresh queue, the dither
 *  shadow, the cursor state and the framebuffer mapping
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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use embedded_graphics::prelude::*;
use embedded_graphics::primitives::Rectangle;
use log::{debug, info, warn};

use crate::display::cursor::{CursorCanvas, CursorConfig, CursorRefreshStateMachine, CursorSprite};
use crate::display::device::{DeviceProbe, DeviceProfile};
use crate::display::dither::Ditherer;
use crate::display::error::DisplayError;
use crate::display::executor::{RefreshExecutor, RefreshRequest, RefreshSettings};
use crate::display::framebuffer::{FbDevice, MxcfbDriver};
use crate::display::queue::{RefreshQueue, RefreshStats};
use crate::display::region::{bounding_union, clip};
use crate::display::sunxi::SunxiDriver;
use crate::display::surface::{blit, copy_rect, invert, PixelSurface, SurfaceBuffer};
use crate::display::traits::{EinkControl, EinkDriver, PointerSource};
use crate::display::waveform::{WaveformId, WaveformSet};

/// Start-up choices, normally filled from the configuration file
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Framebuffer node; the usual candidates when unset
    pub fb_device: Option<PathBuf>,
    /// Switch the framebuffer to this depth at start-up
    pub bpp: Option<u32>,
    /// Framebuffer rotation at start-up, quarter turns
    pub rotate: Option<u32>,
    pub flashing: bool,
    pub software_dither: bool,
    pub hardware_dither: bool,
    /// Wait for every refresh, whatever the device table says
    pub explicit_wait: bool,
    pub fullscreen_waveform: Option<WaveformId>,
    pub partial_waveform: Option<WaveformId>,
    pub fast_waveform: Option<WaveformId>,
    /// Cursor handling, off when None
    pub cursor: Option<CursorConfig>,
    pub standby_sprite: Option<CursorSprite>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fb_device: None,
            bpp: None,
            rotate: None,
            flashing: true,
            software_dither: false,
            hardware_dither: false,
            explicit_wait: false,
            fullscreen_waveform: None,
            partial_waveform: None,
            fast_waveform: None,
            cursor: None,
            standby_sprite: None,
        }
    }
}

impl EngineOptions {
    /// Device-derived set with any configured overrides on top
    pub fn waveforms_for(&self, profile: &DeviceProfile) -> WaveformSet {
        let mut set = WaveformSet::for_device(profile);
        if let Some(w) = self.fullscreen_waveform {
            set.fullscreen = w;
        }
        if let Some(w) = self.partial_waveform {
            set.partial = w;
        }
        if let Some(w) = self.fast_waveform {
            set.fast = w;
        }
        set
    }
}

/// The refresh engine.
///
/// Built once and passed by reference to whatever drives it. The
/// compositor's surface is borrowed per call; everything else is owned.
pub struct EinkEngine {
    // first, so the worker is joined before the mapping goes away
    queue: RefreshQueue,
    framebuffer: Box<dyn PixelSurface + Send>,
    profile: DeviceProfile,
    defaults: WaveformSet,
    ditherer: Ditherer,
    cursor: Option<CursorRefreshStateMachine>,
    cursor_config: Option<CursorConfig>,
    standby_sprite: Option<CursorSprite>,
    pointer: Option<Box<dyn PointerSource>>,
    night_mode: bool,
    hw_invert: bool,
}

impl EinkEngine {
    /// Engine over any driver and framebuffer surface
    pub fn new<D>(
        mut profile: DeviceProfile,
        driver: D,
        framebuffer: Box<dyn PixelSurface + Send>,
        options: &EngineOptions,
    ) -> Result<Self, DisplayError>
    where
        D: EinkDriver + 'static,
    {
        profile.requires_explicit_wait |= options.explicit_wait;
        let defaults = options.waveforms_for(&profile);
        let hw_invert = driver.capabilities().supports_invert;

        info!(
            "waveforms: fullscreen {} partial {} fast {}",
            defaults.fullscreen, defaults.partial, defaults.fast
        );
        if options.hardware_dither {
            info!("hardware dithering requested; it is recorded but has no effect yet");
        }

        let mut settings = RefreshSettings::new(defaults);
        settings.flashing = options.flashing;
        let queue = RefreshQueue::start(RefreshExecutor::new(driver, profile.clone()), settings)?;

        let mut ditherer = Ditherer::new();
        ditherer.enable(options.software_dither, options.hardware_dither, None);

        Ok(Self {
            queue,
            framebuffer,
            profile,
            defaults,
            ditherer,
            cursor: None,
            cursor_config: options.cursor.clone(),
            standby_sprite: options.standby_sprite.clone(),
            pointer: None,
            night_mode: false,
            hw_invert,
        })
    }

    /// Engine on the real hardware: mxcfb on i.MX boards, disp2 on sunxi
    pub fn open(mut profile: DeviceProfile, options: &EngineOptions) -> Result<Self, DisplayError> {
        let candidates = match &options.fb_device {
            Some(path) => vec![path.clone()],
            None => DeviceProbe::default().fb_candidates,
        };
        let device = Arc::new(FbDevice::open_first(&candidates)?);

        if profile.is_sunxi {
            if options.bpp.is_some() || options.rotate.is_some() {
                warn!("sunxi scanout is fixed at 32 bpp unrotated, bpp/rotate ignored");
            }
            let (driver, framebuffer) = SunxiDriver::open(device, &profile)?;
            profile.width = framebuffer.width();
            profile.height = framebuffer.height();
            debug!("sunxi scanout {}x{}", profile.width, profile.height);
            return Self::new(profile, driver, Box::new(framebuffer), options);
        }

        if let Some(bpp) = options.bpp {
            device.set_depth(bpp)?;
        }
        if let Some(rotate) = options.rotate {
            device.set_rotation(rotate)?;
        }
        let framebuffer = device.map()?;
        let geometry = framebuffer.geometry();
        profile.width = geometry.width;
        profile.height = geometry.height;
        debug!("framebuffer {}x{} {:?}, stride {}", geometry.width, geometry.height, geometry.format, geometry.stride);

        let driver = MxcfbDriver::new(Arc::clone(&device), &profile)?;
        Self::new(profile, driver, Box::new(framebuffer), options)
    }

    /// Start cursor handling with a pointer source. A no-op when the
    /// options left the cursor off.
    pub fn attach_pointer(&mut self, pointer: Box<dyn PointerSource>) {
        let Some(config) = self.cursor_config.clone() else {
            debug!("cursor disabled, pointer ignored");
            return;
        };
        let mut machine = CursorRefreshStateMachine::new(config, pointer.position());
        if let Some(sprite) = self.standby_sprite.clone() {
            machine = machine.with_standby_sprite(sprite);
        }
        self.cursor = Some(machine);
        self.pointer = Some(pointer);
        info!("cursor attached");
    }

    pub fn cursor(&self) -> Option<&CursorRefreshStateMachine> {
        self.cursor.as_ref()
    }

    pub fn framebuffer(&self) -> &dyn PixelSurface {
        &*self.framebuffer
    }

    pub fn ditherer(&self) -> &Ditherer {
        &self.ditherer
    }

    pub fn waveforms(&self) -> WaveformSet {
        self.queue.settings().waveforms
    }

    pub fn flashing_enabled(&self) -> bool {
        self.queue.settings().flashing
    }

    pub fn night_mode(&self) -> bool {
        self.night_mode
    }

    pub fn stats(&self) -> RefreshStats {
        self.queue.stats()
    }

    /// Block until every queued refresh has run
    pub fn wait_idle(&self) {
        self.queue.wait_idle();
    }

    /// Stop the refresh worker after it drains the queue
    pub fn shutdown(mut self) {
        self.queue.shutdown();
        info!("engine stopped");
    }

    /// Night mode on a panel that cannot invert: pixels are inverted as
    /// they reach the framebuffer
    fn soft_invert(&self) -> bool {
        self.night_mode && !self.hw_invert
    }

    fn clip(&self, region: &Rectangle) -> Rectangle {
        clip(region, &self.framebuffer.bounds())
    }

    /// Compositor entry point: copy the damaged rectangles of `source` to
    /// the framebuffer and queue one refresh over their union. Returns the
    /// refreshed area.
    pub fn redraw(&mut self, source: &dyn PixelSurface, damage: &[Rectangle]) -> Result<Option<Rectangle>, DisplayError> {
        let area = self.clip(&bounding_union(damage));
        if area.is_zero_sized() {
            return Ok(None);
        }

        if self.ditherer.software_enabled() {
            self.ditherer.dither_region(source, &area);
        }
        let pixels = self.ditherer.blit_source(source);
        let soft_invert = self.soft_invert();

        for rect in damage {
            if let Some(cursor) = self.cursor.as_mut() {
                if cursor.defer_if_cursor(rect) {
                    debug!("deferring {:?} under the cursor", rect);
                    continue;
                }
            }
            blit(pixels, &mut *self.framebuffer, rect);
            if soft_invert {
                invert(&mut *self.framebuffer, rect);
            }
        }

        self.queue.enqueue(RefreshRequest::new(area))?;
        Ok(Some(area))
    }

    /// One cursor timer tick. Returns the interval until the next one, or
    /// None when no cursor is attached.
    pub fn cursor_tick(&mut self, source: &dyn PixelSurface) -> Option<Duration> {
        let (Some(cursor), Some(pointer)) = (self.cursor.as_mut(), self.pointer.as_ref()) else {
            return None;
        };
        let position = pointer.position();
        let mut canvas = EngineCanvas {
            framebuffer: &mut *self.framebuffer,
            source: self.ditherer.blit_source(source),
            queue: &self.queue,
            invert: self.night_mode && !self.hw_invert,
        };
        let cadence = cursor.tick(position, &mut canvas);
        Some(cursor.interval(cadence))
    }

    fn enqueue(&self, request: RefreshRequest) -> Result<(), DisplayError> {
        let area = self.clip(&request.region);
        if area.is_zero_sized() {
            debug!("refresh of {:?} is off screen, skipped", request.region);
            return Ok(());
        }
        self.queue.enqueue(RefreshRequest { region: area, ..request })
    }
}

impl EinkControl for EinkEngine {
    fn set_fullscreen_waveform(&mut self, waveform: WaveformId) {
        self.queue.update_settings(|s| s.waveforms.fullscreen = waveform);
        info!("fullscreen waveform {}", waveform);
    }

    fn set_partial_waveform(&mut self, waveform: WaveformId) {
        self.queue.update_settings(|s| s.waveforms.partial = waveform);
        info!("partial waveform {}", waveform);
    }

    fn set_fast_waveform(&mut self, waveform: WaveformId) {
        self.queue.update_settings(|s| s.waveforms.fast = waveform);
        info!("fast waveform {}", waveform);
    }

    fn reset_to_default_waveforms(&mut self) {
        let defaults = self.defaults;
        self.queue.update_settings(|s| s.waveforms = defaults);
        info!("waveforms reset to defaults");
    }

    fn set_flashing_enabled(&mut self, enabled: bool) {
        self.queue.update_settings(|s| s.flashing = enabled);
        debug!("flashing {}", if enabled { "on" } else { "off" });
    }

    fn toggle_night_mode(&mut self) -> bool {
        self.night_mode = !self.night_mode;
        let on = self.night_mode;
        if self.hw_invert {
            self.queue.update_settings(|s| s.night_mode = on);
        } else {
            debug!("no hardware inversion, inverting the framebuffer");
            let bounds = self.framebuffer.bounds();
            invert(&mut *self.framebuffer, &bounds);
            let fullscreen = self.waveforms().fullscreen;
            if let Err(e) = self.enqueue(RefreshRequest::new(bounds).forced(Some(fullscreen)).flashing()) {
                warn!("night mode refresh dropped: {}", e);
            }
        }
        info!("night mode {}", if on { "on" } else { "off" });
        on
    }

    fn clear_screen(&mut self, wait: bool) -> Result<(), DisplayError> {
        let bounds = self.framebuffer.bounds();
        let white = if self.soft_invert() { 0x00 } else { 0xFF };
        self.framebuffer.fill_gray(&bounds, white);
        let fullscreen = self.waveforms().fullscreen;
        self.enqueue(RefreshRequest::new(bounds).forced(Some(fullscreen)).flashing().wait(wait))?;
        if wait {
            self.queue.wait_idle();
        }
        Ok(())
    }

    fn enable_dithering(&mut self, software: bool, hardware: bool) {
        self.ditherer.enable(software, hardware, None);
    }

    fn manual_refresh(&mut self, region: Rectangle, forced: Option<WaveformId>) -> Result<(), DisplayError> {
        self.enqueue(RefreshRequest::new(region).forced(forced))
    }

    fn get_device_profile(&self) -> DeviceProfile {
        self.profile.clone()
    }
}

/// The engine as the cursor state machine sees it during one tick
struct EngineCanvas<'a> {
    framebuffer: &'a mut dyn PixelSurface,
    source: &'a dyn PixelSurface,
    queue: &'a RefreshQueue,
    /// Software night mode
    invert: bool,
}

impl CursorCanvas for EngineCanvas<'_> {
    fn waveforms(&self) -> WaveformSet {
        self.queue.settings().waveforms
    }

    fn capture(&self, area: &Rectangle) -> SurfaceBuffer {
        SurfaceBuffer::crop(self.source, area)
    }

    fn restore(&mut self, fragment: &SurfaceBuffer, at: Point) {
        copy_rect(fragment, &fragment.bounds(), self.framebuffer, at);
        if self.invert {
            invert(self.framebuffer, &Rectangle::new(at, fragment.size()));
        }
    }

    fn restore_from_source(&mut self, area: &Rectangle) {
        blit(self.source, self.framebuffer, area);
        if self.invert {
            invert(self.framebuffer, area);
        }
    }

    fn draw_sprite(&mut self, sprite: &CursorSprite, at: Point) {
        if self.invert {
            sprite.inverted().draw_onto(self.framebuffer, at);
        } else {
            sprite.draw_onto(self.framebuffer, at);
        }
    }

    fn refresh(&mut self, area: Rectangle, forced: Option<WaveformId>, wait: bool) {
        let area = clip(&area, &self.framebuffer.bounds());
        if area.is_zero_sized() {
            return;
        }
        if let Err(e) = self.queue.enqueue(RefreshRequest::new(area).forced(forced).wait(wait)) {
            warn!("cursor refresh dropped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::device::DeviceRegistry;
    use crate::display::drivers::mock::MockDriver;
    use crate::display::surface::PixelFormat;
    use std::sync::Mutex;

    fn rect(x: i32, y: i32, w: u32, h: u32) -> Rectangle {
        Rectangle::new(Point::new(x, y), Size::new(w, h))
    }

    fn engine_with(driver: MockDriver, options: &EngineOptions) -> EinkEngine {
        let profile = DeviceProfile::from_quirks(DeviceRegistry::lookup("nova", 0), "nova", 0, 200, 160, None);
        let fb = Box::new(SurfaceBuffer::new(200, 160, PixelFormat::Gray8));
        EinkEngine::new(profile, driver, fb, options).unwrap()
    }

    #[test]
    fn test_redraw_blits_and_queues_union() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut engine = engine_with(driver, &EngineOptions::default());
        let mut source = SurfaceBuffer::new(200, 160, PixelFormat::Gray8);
        source.fill_gray(&rect(10, 10, 20, 20), 0);

        let area = engine.redraw(&source, &[rect(10, 10, 10, 10), rect(20, 20, 10, 10)]).unwrap();
        engine.wait_idle();

        assert_eq!(area, Some(rect(10, 10, 20, 20)));
        assert_eq!(engine.framebuffer().gray_at(15, 15), Some(0));
        // outside the damage the framebuffer is untouched
        assert_eq!(engine.framebuffer().gray_at(25, 12), Some(0xFF));
        let s = state.lock().unwrap();
        assert_eq!(s.updates.len(), 1);
        assert_eq!(s.updates[0].region, rect(10, 10, 20, 20));
        assert_eq!(s.updates[0].waveform, WaveformId::Du);
    }

    #[test]
    fn test_empty_or_offscreen_damage_is_ignored() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut engine = engine_with(driver, &EngineOptions::default());
        let source = SurfaceBuffer::new(200, 160, PixelFormat::Gray8);

        assert_eq!(engine.redraw(&source, &[]).unwrap(), None);
        assert_eq!(engine.redraw(&source, &[rect(500, 500, 10, 10)]).unwrap(), None);
        engine.manual_refresh(rect(-50, -50, 10, 10), None).unwrap();
        engine.wait_idle();

        assert!(state.lock().unwrap().updates.is_empty());
    }

    #[test]
    fn test_waveform_setters_and_reset() {
        let mut engine = engine_with(MockDriver::new(), &EngineOptions::default());
        let defaults = engine.waveforms();
        assert_eq!(defaults.partial, WaveformId::Reagl);

        engine.set_partial_waveform(WaveformId::Gl16);
        engine.set_fast_waveform(WaveformId::A2);
        engine.set_fullscreen_waveform(WaveformId::Gc4);
        assert_eq!(engine.waveforms(), WaveformSet {
            fullscreen: WaveformId::Gc4,
            partial: WaveformId::Gl16,
            fast: WaveformId::A2,
        });

        engine.reset_to_default_waveforms();
        assert_eq!(engine.waveforms(), defaults);
    }

    #[test]
    fn test_configured_overrides_become_defaults() {
        let options = EngineOptions { fast_waveform: Some(WaveformId::A2), ..Default::default() };
        let mut engine = engine_with(MockDriver::new(), &options);
        assert_eq!(engine.waveforms().fast, WaveformId::A2);
        engine.set_fast_waveform(WaveformId::Du);
        engine.reset_to_default_waveforms();
        assert_eq!(engine.waveforms().fast, WaveformId::A2);
    }

    #[test]
    fn test_clear_screen_flashes_and_waits() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut engine = engine_with(driver, &EngineOptions::default());
        engine.set_flashing_enabled(false);

        engine.clear_screen(true).unwrap();

        let s = state.lock().unwrap();
        assert_eq!(s.updates.len(), 1);
        assert!(s.updates[0].flashing);
        assert_eq!(s.updates[0].waveform, WaveformId::Gc16);
        assert_eq!(s.waits, vec![s.updates[0].marker]);
        assert_eq!(engine.framebuffer().gray_at(100, 100), Some(0xFF));
    }

    #[test]
    fn test_night_mode_with_and_without_hardware_inversion() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut engine = engine_with(driver, &EngineOptions::default());
        assert!(engine.toggle_night_mode());
        engine.manual_refresh(rect(0, 0, 10, 10), None).unwrap();
        engine.wait_idle();
        assert!(state.lock().unwrap().updates[0].inverted);
        assert!(!engine.toggle_night_mode());

        let driver = MockDriver::without_inversion();
        let state = driver.state();
        let mut engine = engine_with(driver, &EngineOptions::default());
        assert!(engine.toggle_night_mode());
        assert!(engine.night_mode());
        engine.manual_refresh(rect(0, 0, 10, 10), None).unwrap();
        engine.wait_idle();
        let s = state.lock().unwrap();
        // the flip itself, then the manual refresh; neither asks the EPDC
        assert_eq!(s.updates.len(), 2);
        assert!(s.updates.iter().all(|u| !u.inverted));
        assert_eq!(s.updates[0].region, rect(0, 0, 200, 160));
    }

    #[test]
    fn test_software_night_mode_inverts_framebuffer() {
        let driver = MockDriver::without_inversion();
        let state = driver.state();
        let mut engine = engine_with(driver, &EngineOptions::default());
        let mut source = SurfaceBuffer::new(200, 160, PixelFormat::Gray8);
        source.fill_gray(&rect(20, 20, 30, 30), 0x30);

        engine.toggle_night_mode();
        assert_eq!(engine.framebuffer().gray_at(5, 5), Some(0x00));

        engine.redraw(&source, &[rect(20, 20, 30, 30)]).unwrap();
        assert_eq!(engine.framebuffer().gray_at(25, 25), Some(0xCF));

        engine.clear_screen(true).unwrap();
        assert_eq!(engine.framebuffer().gray_at(25, 25), Some(0x00));

        engine.toggle_night_mode();
        engine.wait_idle();
        assert_eq!(engine.framebuffer().gray_at(25, 25), Some(0xFF));
        assert!(state.lock().unwrap().updates.iter().all(|u| !u.inverted));
    }

    #[test]
    fn test_dithered_redraw_goes_through_shadow() {
        let mut engine = engine_with(MockDriver::new(), &EngineOptions::default());
        engine.enable_dithering(true, false);
        let mut source = SurfaceBuffer::new(200, 160, PixelFormat::Gray8);
        let all = source.bounds();
        source.fill_gray(&all, 100);

        engine.redraw(&source, &[rect(0, 0, 50, 50)]).unwrap();

        assert_eq!(engine.ditherer().shadow().map(|s| s.dimensions()), Some(Size::new(200, 160)));
        let written = engine.framebuffer().gray_at(10, 10).unwrap();
        assert_eq!(written % 17, 0);
        assert_ne!(written, 100);
    }

    struct FixedPointer(Arc<Mutex<Point>>);

    impl PointerSource for FixedPointer {
        fn position(&self) -> Point {
            *self.0.lock().unwrap()
        }
    }

    #[test]
    fn test_cursor_tick_and_deferral() {
        let driver = MockDriver::new();
        let state = driver.state();
        let options = EngineOptions { cursor: Some(CursorConfig::default()), ..Default::default() };
        let mut engine = engine_with(driver, &options);
        let source = SurfaceBuffer::new(200, 160, PixelFormat::Gray8);
        assert_eq!(engine.cursor_tick(&source), None);

        let pos = Arc::new(Mutex::new(Point::new(0, 0)));
        engine.attach_pointer(Box::new(FixedPointer(Arc::clone(&pos))));
        assert_eq!(engine.cursor_tick(&source), Some(Duration::from_millis(300)));

        *pos.lock().unwrap() = Point::new(40, 40);
        assert_eq!(engine.cursor_tick(&source), Some(Duration::from_millis(125)));
        let cursor_rect = engine.cursor().and_then(|c| c.dirty_rect()).unwrap();

        engine.redraw(&source, &[cursor_rect]).unwrap();
        assert_eq!(engine.cursor().map(|c| c.deferred().len()), Some(1));
        // cursor pixels survived the redraw
        assert_eq!(engine.framebuffer().gray_at(44, 50), Some(0));

        assert_eq!(engine.cursor_tick(&source), Some(Duration::from_millis(300)));
        engine.wait_idle();
        let waveforms: Vec<WaveformId> = state.lock().unwrap().updates.iter().map(|u| u.waveform).collect();
        // cursor (fast), deferred redraw union (small, fast), standby (partial)
        assert_eq!(waveforms, vec![WaveformId::Du, WaveformId::Du, WaveformId::Reagl]);
    }

    #[test]
    fn test_attach_pointer_without_cursor_config() {
        let mut engine = engine_with(MockDriver::new(), &EngineOptions::default());
        engine.attach_pointer(Box::new(FixedPointer(Arc::new(Mutex::new(Point::zero())))));
        assert!(engine.cursor().is_none());
    }
}
