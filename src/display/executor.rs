/*
 *  display/executor.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Turns one refresh request into one hardware update, recovering once
 *  from a frozen panel
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

use std::thread;
use std::time::Duration;

use embedded_graphics::geometry::Size;
use embedded_graphics::primitives::Rectangle;
use log::{debug, error, warn};

use crate::display::device::DeviceProfile;
use crate::display::error::DisplayError;
use crate::display::region::RegionClass;
use crate::display::traits::{EinkDriver, RefreshCommand};
use crate::display::waveform::{WaveformId, WaveformSet};

/// Stand-in for a completion wait the panel cannot be trusted with
pub const FALLBACK_WAIT: Duration = Duration::from_micros(500);

/// Settings copied into every request when it is queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSettings {
    pub waveforms: WaveformSet,
    pub flashing: bool,
    pub night_mode: bool,
}

impl RefreshSettings {
    pub fn new(waveforms: WaveformSet) -> Self {
        Self { waveforms, flashing: true, night_mode: false }
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self::new(WaveformSet::default())
    }
}

/// A region waiting to be refreshed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub region: Rectangle,
    pub forced_waveform: Option<WaveformId>,
    pub wait_for_completion: bool,
    /// Flash regardless of region class or the flashing setting
    pub force_flashing: bool,
    /// Filled in by the queue at enqueue time
    pub settings: RefreshSettings,
}

impl RefreshRequest {
    pub fn new(region: Rectangle) -> Self {
        Self {
            region,
            forced_waveform: None,
            wait_for_completion: false,
            force_flashing: false,
            settings: RefreshSettings::default(),
        }
    }

    pub fn forced(mut self, waveform: Option<WaveformId>) -> Self {
        self.forced_waveform = waveform;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait_for_completion = wait;
        self
    }

    pub fn flashing(mut self) -> Self {
        self.force_flashing = true;
        self
    }
}

/// How a successful refresh went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed,
    /// The panel was frozen and came back after an unblank
    Recovered,
}

/// Issues hardware refreshes. Owned by the refresh worker.
pub struct RefreshExecutor<D: EinkDriver> {
    driver: D,
    profile: DeviceProfile,
    next_marker: u32,
    last_marker: Option<u32>,
}

impl<D: EinkDriver> RefreshExecutor<D> {
    pub fn new(driver: D, profile: DeviceProfile) -> Self {
        Self { driver, profile, next_marker: 1, last_marker: None }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn screen(&self) -> Size {
        self.profile.screen_size()
    }

    /// Resolve the request into the command the driver will see
    pub fn command_for(&mut self, request: &RefreshRequest) -> RefreshCommand {
        let class = RegionClass::classify(&request.region, self.screen());
        let waveform = class.select(&request.settings.waveforms, request.forced_waveform);
        let flashing = request.force_flashing || (class == RegionClass::Full && request.settings.flashing);

        let marker = self.next_marker;
        // markers are never zero
        self.next_marker = self.next_marker.checked_add(1).unwrap_or(1);

        RefreshCommand {
            region: request.region,
            waveform,
            flashing,
            inverted: request.settings.night_mode && self.driver.capabilities().supports_invert,
            marker,
        }
    }

    /// Issue one refresh. A frozen panel gets exactly one unblank and
    /// one retry; any other failure is final.
    pub fn execute(&mut self, request: &RefreshRequest) -> Result<RefreshOutcome, DisplayError> {
        let command = self.command_for(request);
        debug!(
            "refresh {:?} {}x{} {} {}marker {}",
            command.region.top_left,
            command.region.size.width,
            command.region.size.height,
            command.waveform,
            if command.flashing { "flashing " } else { "" },
            command.marker
        );

        let outcome = match self.driver.send_update(&command) {
            Ok(()) => RefreshOutcome::Completed,
            Err(DisplayError::DisplayFrozen) => {
                warn!("display frozen, unblanking and retrying once");
                self.driver.unblank().map_err(|e| {
                    error!("unblank after freeze failed: {}", e);
                    DisplayError::RefreshFailed(format!("unblank after freeze failed: {}", e))
                })?;
                self.driver.send_update(&command).map_err(|e| {
                    error!("retry after unblank failed: {}", e);
                    DisplayError::RefreshFailed(format!("retry after unblank failed: {}", e))
                })?;
                RefreshOutcome::Recovered
            }
            Err(DisplayError::RefreshFailed(msg)) => {
                error!("refresh failed: {}", msg);
                return Err(DisplayError::RefreshFailed(msg));
            }
            Err(e) => {
                error!("refresh failed: {}", e);
                return Err(DisplayError::RefreshFailed(e.to_string()));
            }
        };

        self.last_marker = Some(command.marker);
        Ok(outcome)
    }

    /// Block until the last refresh is on the panel, when the device needs
    /// it or `force` asks. Best effort: failures are logged, not returned.
    pub fn wait_for_completion(&mut self, force: bool) {
        if !(self.profile.requires_explicit_wait || force) {
            return;
        }
        let Some(marker) = self.last_marker else {
            return;
        };

        if self.profile.has_reliable_completion_wait && self.driver.capabilities().supports_completion_wait {
            if let Err(e) = self.driver.wait_for_update_complete(marker) {
                warn!("waiting for marker {} failed: {}", marker, e);
            }
        } else {
            thread::sleep(FALLBACK_WAIT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::device::DeviceRegistry;
    use crate::display::drivers::mock::{MockDriver, MockResponse};
    use embedded_graphics::prelude::*;

    fn profile(codename: &str) -> DeviceProfile {
        DeviceProfile::from_quirks(DeviceRegistry::lookup(codename, 0), codename, 0, 1072, 1448, None)
    }

    fn rect(x: i32, y: i32, w: u32, h: u32) -> Rectangle {
        Rectangle::new(Point::new(x, y), Size::new(w, h))
    }

    #[test]
    fn test_full_update_flashes_with_fullscreen_waveform() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut exec = RefreshExecutor::new(driver, profile("nova"));

        let outcome = exec.execute(&RefreshRequest::new(rect(0, 0, 1000, 1400))).unwrap();

        assert_eq!(outcome, RefreshOutcome::Completed);
        let s = state.lock().unwrap();
        assert_eq!(s.updates.len(), 1);
        assert_eq!(s.updates[0].waveform, WaveformId::Gc16);
        assert!(s.updates[0].flashing);
        assert_eq!(s.updates[0].marker, 1);
    }

    #[test]
    fn test_flashing_disabled_and_partial_regions_do_not_flash() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut exec = RefreshExecutor::new(driver, profile("nova"));

        let mut full = RefreshRequest::new(rect(0, 0, 1072, 1448));
        full.settings.flashing = false;
        exec.execute(&full).unwrap();
        exec.execute(&RefreshRequest::new(rect(0, 0, 200, 300))).unwrap();
        exec.execute(&RefreshRequest::new(rect(0, 0, 200, 300)).flashing()).unwrap();

        let s = state.lock().unwrap();
        let flashes: Vec<bool> = s.updates.iter().map(|u| u.flashing).collect();
        assert_eq!(flashes, vec![false, false, true]);
    }

    #[test]
    fn test_freeze_recovered_with_one_unblank() {
        let driver = MockDriver::new();
        let state = driver.state();
        driver.script([MockResponse::Frozen, MockResponse::Ok]);
        let mut exec = RefreshExecutor::new(driver, profile("nova"));

        let outcome = exec.execute(&RefreshRequest::new(rect(0, 0, 200, 300))).unwrap();

        assert_eq!(outcome, RefreshOutcome::Recovered);
        let s = state.lock().unwrap();
        assert_eq!(s.unblank_count, 1);
        assert_eq!(s.attempts, 2);
        assert_eq!(s.updates.len(), 1);
    }

    #[test]
    fn test_freeze_twice_fails_without_third_attempt() {
        let driver = MockDriver::new();
        let state = driver.state();
        driver.script([MockResponse::Frozen, MockResponse::Frozen, MockResponse::Ok]);
        let mut exec = RefreshExecutor::new(driver, profile("nova"));

        let err = exec.execute(&RefreshRequest::new(rect(0, 0, 200, 300))).unwrap_err();

        assert!(matches!(err, DisplayError::RefreshFailed(_)));
        let s = state.lock().unwrap();
        assert_eq!(s.unblank_count, 1);
        assert_eq!(s.attempts, 2);
    }

    #[test]
    fn test_failed_unblank_is_refresh_failed() {
        let driver = MockDriver::new();
        let state = driver.state();
        driver.script([MockResponse::Frozen]);
        driver.simulate_unblank_failure(true);
        let mut exec = RefreshExecutor::new(driver, profile("nova"));

        let err = exec.execute(&RefreshRequest::new(rect(0, 0, 200, 300))).unwrap_err();

        assert!(matches!(err, DisplayError::RefreshFailed(_)));
        assert_eq!(state.lock().unwrap().attempts, 1);
    }

    #[test]
    fn test_other_failure_is_not_retried() {
        let driver = MockDriver::new();
        let state = driver.state();
        driver.script([MockResponse::Fail]);
        let mut exec = RefreshExecutor::new(driver, profile("nova"));

        assert!(exec.execute(&RefreshRequest::new(rect(0, 0, 10, 10))).is_err());
        let s = state.lock().unwrap();
        assert_eq!(s.unblank_count, 0);
        assert_eq!(s.attempts, 1);
    }

    #[test]
    fn test_wait_only_when_required_or_forced() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut exec = RefreshExecutor::new(driver, profile("nova"));
        exec.execute(&RefreshRequest::new(rect(0, 0, 10, 10))).unwrap();

        exec.wait_for_completion(false);
        assert!(state.lock().unwrap().waits.is_empty());

        exec.wait_for_completion(true);
        assert_eq!(state.lock().unwrap().waits, vec![1]);
    }

    #[test]
    fn test_explicit_wait_profile_blocks_without_force() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut p = profile("nova");
        assert!(p.has_reliable_completion_wait);
        p.requires_explicit_wait = true;
        let mut exec = RefreshExecutor::new(driver, p);
        exec.execute(&RefreshRequest::new(rect(0, 0, 10, 10))).unwrap();
        exec.execute(&RefreshRequest::new(rect(20, 20, 10, 10))).unwrap();

        exec.wait_for_completion(false);

        // only the latest marker is waited on
        assert_eq!(state.lock().unwrap().waits, vec![2]);
    }

    #[test]
    fn test_driver_without_completion_wait_sleeps() {
        let driver = MockDriver::without_completion_wait();
        let state = driver.state();
        let mut exec = RefreshExecutor::new(driver, profile("nova"));
        exec.execute(&RefreshRequest::new(rect(0, 0, 10, 10))).unwrap();

        exec.wait_for_completion(true);

        assert!(state.lock().unwrap().waits.is_empty());
    }

    #[test]
    fn test_unreliable_wait_never_touches_hardware() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut p = profile("storm");
        p.requires_explicit_wait = true;
        let mut exec = RefreshExecutor::new(driver, p);
        exec.execute(&RefreshRequest::new(rect(0, 0, 10, 10))).unwrap();

        exec.wait_for_completion(false);
        exec.wait_for_completion(true);

        assert!(state.lock().unwrap().waits.is_empty());
    }

    #[test]
    fn test_failing_wait_is_swallowed() {
        let driver = MockDriver::new();
        let state = driver.state();
        driver.simulate_wait_failure(true);
        let mut exec = RefreshExecutor::new(driver, profile("nova"));
        exec.execute(&RefreshRequest::new(rect(0, 0, 10, 10))).unwrap();

        exec.wait_for_completion(true);
        assert_eq!(state.lock().unwrap().waits, vec![1]);
    }

    #[test]
    fn test_night_mode_inverts_only_when_driver_can() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut exec = RefreshExecutor::new(driver, profile("nova"));
        let mut req = RefreshRequest::new(rect(0, 0, 10, 10));
        req.settings.night_mode = true;
        exec.execute(&req).unwrap();
        assert!(state.lock().unwrap().updates[0].inverted);

        let driver = MockDriver::without_inversion();
        let state = driver.state();
        let mut exec = RefreshExecutor::new(driver, profile("nova"));
        exec.execute(&req).unwrap();
        assert!(!state.lock().unwrap().updates[0].inverted);
    }
}
