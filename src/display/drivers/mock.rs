/*
 *  display/drivers/mock.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Recording refresh driver for tests and --dry-run
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

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::display::error::DisplayError;
use crate::display::traits::{DriverCapabilities, EinkDriver, RefreshCommand};

/// Scripted answer for the next `send_update`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockResponse {
    Ok,
    /// Reject with the freeze code
    Frozen,
    /// Reject with some other error
    Fail,
    /// Panic inside the driver, as a crashing worker would
    Panic,
}

/// Mock refresh driver
///
/// Simulates an EPDC without hardware. It's useful for:
/// - Unit tests
/// - Integration tests
/// - Trying the CLI on a desktop (`--dry-run`)
///
/// Every operation is recorded in a shared state that tests keep a handle
/// to after the driver has moved into the refresh worker.
#[derive(Debug, Clone)]
pub struct MockDriver {
    capabilities: DriverCapabilities,
    state: Arc<Mutex<MockDriverState>>,
}

/// Internal state for the mock driver (shared for inspection in tests)
#[derive(Debug, Default)]
pub struct MockDriverState {
    /// Updates the panel accepted, in order
    pub updates: Vec<RefreshCommand>,

    /// Every `send_update` call, accepted or not
    pub attempts: usize,

    /// Number of times unblank() was called
    pub unblank_count: usize,

    /// Markers passed to wait_for_update_complete()
    pub waits: Vec<u32>,

    /// Updates currently inside send_update()
    pub in_flight: usize,

    /// Highest `in_flight` ever seen
    pub max_in_flight: usize,

    /// Answers for the next updates; empty means Ok
    pub script: VecDeque<MockResponse>,

    /// Simulate failures (for error testing)
    pub simulate_unblank_failure: bool,
    pub simulate_wait_failure: bool,

    /// Time each update takes
    pub update_delay: Option<Duration>,
}

fn lock(state: &Mutex<MockDriverState>) -> MutexGuard<'_, MockDriverState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockDriver {
    /// A mock that supports inversion and completion waits
    pub fn new() -> Self {
        Self {
            capabilities: DriverCapabilities {
                name: "mock",
                supports_invert: true,
                supports_completion_wait: true,
            },
            state: Arc::new(Mutex::new(MockDriverState::default())),
        }
    }

    /// A mock with no usable completion wait
    pub fn without_completion_wait() -> Self {
        let mut driver = Self::new();
        driver.capabilities.supports_completion_wait = false;
        driver
    }

    /// A mock whose panel cannot invert (no night mode in hardware)
    pub fn without_inversion() -> Self {
        let mut driver = Self::new();
        driver.capabilities.supports_invert = false;
        driver
    }

    /// Get reference to state for inspection in tests
    pub fn state(&self) -> Arc<Mutex<MockDriverState>> {
        Arc::clone(&self.state)
    }

    /// Queue answers for the next updates
    pub fn script(&self, responses: impl IntoIterator<Item = MockResponse>) {
        lock(&self.state).script.extend(responses);
    }

    pub fn simulate_unblank_failure(&self, fail: bool) {
        lock(&self.state).simulate_unblank_failure = fail;
    }

    pub fn simulate_wait_failure(&self, fail: bool) {
        lock(&self.state).simulate_wait_failure = fail;
    }

    pub fn set_update_delay(&self, delay: Duration) {
        lock(&self.state).update_delay = Some(delay);
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EinkDriver for MockDriver {
    fn capabilities(&self) -> &DriverCapabilities {
        &self.capabilities
    }

    fn send_update(&mut self, command: &RefreshCommand) -> Result<(), DisplayError> {
        let (response, delay) = {
            let mut state = lock(&self.state);
            state.attempts += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            (state.script.pop_front().unwrap_or(MockResponse::Ok), state.update_delay)
        }; // Release lock while the "panel" works

        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = lock(&self.state);
        state.in_flight -= 1;
        match response {
            MockResponse::Ok => {
                debug!("mock update {:?} {} marker {}", command.region, command.waveform, command.marker);
                state.updates.push(command.clone());
                Ok(())
            }
            MockResponse::Frozen => Err(DisplayError::DisplayFrozen),
            MockResponse::Fail => Err(DisplayError::RefreshFailed("Simulated update failure".to_string())),
            MockResponse::Panic => {
                drop(state);
                panic!("simulated driver crash on marker {}", command.marker);
            }
        }
    }

    fn unblank(&mut self) -> Result<(), DisplayError> {
        let mut state = lock(&self.state);
        state.unblank_count += 1;
        if state.simulate_unblank_failure {
            return Err(DisplayError::RefreshFailed("Simulated unblank failure".to_string()));
        }
        Ok(())
    }

    fn wait_for_update_complete(&mut self, marker: u32) -> Result<(), DisplayError> {
        let mut state = lock(&self.state);
        state.waits.push(marker);
        if state.simulate_wait_failure {
            return Err(DisplayError::RefreshFailed("Simulated wait timeout".to_string()));
        }
        Ok(())
    }
}
