/*
 *  display/queue.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Refresh queue and its single worker thread
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
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::display::error::DisplayError;
use crate::display::executor::{RefreshExecutor, RefreshOutcome, RefreshRequest, RefreshSettings};
use crate::display::traits::EinkDriver;

const WORKER_NAME: &str = "eink-refresh";

/// Counters kept by the worker, readable from any thread
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub executed: u64,
    /// Refreshes that needed the freeze recovery
    pub recovered: u64,
    pub failed: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<RefreshRequest>,
    settings: RefreshSettings,
    exit: bool,
    busy: bool,
    stats: RefreshStats,
}

/// Mutex plus the one condvar signalling new work, exit and idle
#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    signal: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, QueueState>) -> MutexGuard<'a, QueueState> {
        self.signal.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO of refresh requests drained by one background thread, so at most
/// one hardware update is ever in flight.
pub struct RefreshQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl RefreshQueue {
    /// Spawn the worker, handing it the executor
    pub fn start<D>(executor: RefreshExecutor<D>, settings: RefreshSettings) -> Result<Self, DisplayError>
    where
        D: EinkDriver + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                settings,
                exit: false,
                busy: false,
                stats: RefreshStats::default(),
            }),
            signal: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || run_worker(worker_shared, executor))?;

        Ok(Self { shared, worker: Some(worker) })
    }

    /// Queue a request, stamping it with the current settings. Never
    /// waits for the hardware.
    pub fn enqueue(&self, mut request: RefreshRequest) -> Result<(), DisplayError> {
        let mut state = self.shared.lock();
        if state.exit {
            warn!("refresh of {:?} rejected, queue is closed", request.region);
            return Err(DisplayError::QueueClosed);
        }
        request.settings = state.settings;
        state.pending.push_back(request);
        drop(state);
        self.shared.signal.notify_all();
        Ok(())
    }

    /// Current settings
    pub fn settings(&self) -> RefreshSettings {
        self.shared.lock().settings
    }

    /// Change settings under the queue lock; later requests see the change
    pub fn update_settings<R>(&self, f: impl FnOnce(&mut RefreshSettings) -> R) -> R {
        f(&mut self.shared.lock().settings)
    }

    pub fn stats(&self) -> RefreshStats {
        self.shared.lock().stats.clone()
    }

    /// Block until nothing is queued or executing
    pub fn wait_idle(&self) {
        let mut state = self.shared.lock();
        while !state.pending.is_empty() || state.busy {
            if self.worker.as_ref().is_none_or(|w| w.is_finished()) {
                break;
            }
            state = self.shared.wait(state);
        }
    }

    /// Ask the worker to stop once the queue is drained
    pub fn do_exit(&self) {
        self.shared.lock().exit = true;
        self.shared.signal.notify_all();
    }

    /// `do_exit` and join the worker
    pub fn shutdown(&mut self) {
        self.do_exit();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("refresh worker panicked");
            }
        }
    }
}

impl Drop for RefreshQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Closes the queue and wakes waiters if the worker dies mid-request
struct CrashGuard<'a>(&'a Shared);

impl Drop for CrashGuard<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        let mut state = self.0.lock();
        error!("refresh worker crashed, {} request(s) dropped", state.pending.len());
        state.exit = true;
        state.busy = false;
        state.pending.clear();
        drop(state);
        self.0.signal.notify_all();
    }
}

fn run_worker<D: EinkDriver>(shared: Arc<Shared>, mut executor: RefreshExecutor<D>) {
    info!("refresh worker started ({})", executor.driver().capabilities().name);
    let _guard = CrashGuard(&shared);

    loop {
        let request = {
            let mut state = shared.lock();
            loop {
                if let Some(request) = state.pending.pop_front() {
                    state.busy = true;
                    break Some(request);
                }
                if state.exit {
                    break None;
                }
                state = shared.wait(state);
            }
        };
        let Some(request) = request else {
            break;
        };

        let result = executor.execute(&request);
        if result.is_ok() {
            executor.wait_for_completion(request.wait_for_completion);
        }

        let mut state = shared.lock();
        match result {
            Ok(outcome) => {
                state.stats.executed += 1;
                if outcome == RefreshOutcome::Recovered {
                    state.stats.recovered += 1;
                }
            }
            Err(e) => {
                state.stats.failed += 1;
                state.stats.last_error = Some(e.to_string());
            }
        }
        state.busy = false;
        let idle = state.pending.is_empty();
        drop(state);
        if idle {
            shared.signal.notify_all();
        }
    }

    debug!("refresh worker exiting");
    // wake anyone still in wait_idle
    shared.signal.notify_all();
}
