/*
 *  display/error.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
 *
 *  Unified error types for the refresh engine
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

use std::fmt;
use std::error::Error;
use std::io;

/// Unified error type for all engine operations
#[derive(Debug)]
pub enum DisplayError {
    /// Framebuffer node missing, unopenable or unmappable
    HardwareUnavailable(String),

    /// The panel refused a refresh with the freeze code (EPERM).
    /// Recovered inside the executor, never returned by it.
    DisplayFrozen,

    /// Refresh rejected by the panel, or the retry after a freeze failed
    RefreshFailed(String),

    /// Invalid configuration
    InvalidConfiguration(String),

    /// The refresh worker has been asked to exit
    QueueClosed,

    /// I/O error talking to the device
    Io(io::Error),
}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayError::HardwareUnavailable(msg) =>
                write!(f, "E-ink hardware unavailable: {}", msg),
            DisplayError::DisplayFrozen =>
                write!(f, "Display is frozen (refresh rejected with EPERM)"),
            DisplayError::RefreshFailed(msg) =>
                write!(f, "Refresh failed: {}", msg),
            DisplayError::InvalidConfiguration(msg) =>
                write!(f, "Invalid configuration: {}", msg),
            DisplayError::QueueClosed =>
                write!(f, "Refresh queue is closed"),
            DisplayError::Io(err) =>
                write!(f, "Device I/O error: {}", err),
        }
    }
}

impl Error for DisplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DisplayError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DisplayError {
    fn from(err: io::Error) -> Self {
        DisplayError::Io(err)
    }
}
