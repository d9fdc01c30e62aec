/*
 *  main.rs
 *
 *  einkd - e-ink refresh engine
 *  (c) 2020-26 Stuart Hunter
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

use anyhow::{Context, Result};
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::Rectangle;
use env_logger::Env;
use log::{error, info, warn};

use einkd::config::{self, Command, Config};
use einkd::display::device::{self, DeviceProfile, DeviceRegistry};
use einkd::display::drivers::mock::{MockDriver, MockDriverState};
use einkd::display::{EinkControl, EinkEngine, EngineOptions, PixelFormat, SurfaceBuffer};

use std::sync::{Arc, Mutex};

include!(concat!(env!("OUT_DIR"), "/build_info.rs"));

/// Panel used by --dry-run when the codename is unknown to the registry
const DRY_RUN_SIZE: (u32, u32) = (1072, 1448);

/// Engine over an in-memory 8-bit panel and the recording driver
fn dry_run_engine(cfg: &Config, options: &EngineOptions) -> Result<(EinkEngine, Arc<Mutex<MockDriverState>>)> {
    let codename = cfg.probe().codename();
    let quirks = DeviceRegistry::lookup(&codename, 0);
    let (width, height) = DRY_RUN_SIZE;
    let profile = DeviceProfile::from_quirks(quirks, &codename, 0, width, height, None);

    let driver = MockDriver::new();
    let state = driver.state();
    let surface = SurfaceBuffer::new(width, height, PixelFormat::Gray8);
    let engine = EinkEngine::new(profile, driver, Box::new(surface), options)
        .context("starting dry-run engine")?;
    Ok((engine, state))
}

fn print_info(engine: &EinkEngine) {
    let profile = engine.get_device_profile();
    let waveforms = engine.waveforms();
    println!("device      {} ({})", profile.kind, profile.codename);
    println!("model       {}", profile.model_number);
    println!("mark        {}", profile.mark);
    println!(
        "screen      {}x{} px, {}x{} mm @ {} dpi",
        profile.width, profile.height, profile.physical_size.width, profile.physical_size.height, profile.dpi
    );
    println!("reagl       {}", profile.is_reagl);
    let wait = if profile.has_reliable_completion_wait { "reliable" } else { "unreliable" };
    println!("wait        {}", wait);
    println!("fullscreen  {}", waveforms.fullscreen);
    println!("partial     {}", waveforms.partial);
    println!("fast        {}", waveforms.fast);
}

fn main() -> Result<()> {
    let (cli, cfg) = config::load().context("loading configuration")?;

    if cli.dump_config {
        print!("{}", config::to_yaml(&cfg)?);
        return Ok(());
    }

    env_logger::Builder::from_env(Env::default().default_filter_or(cfg.log_level()))
        .format_timestamp_secs()
        .init();

    info!("einkd v.{} built {}", env!("CARGO_PKG_VERSION"), BUILD_DATE);

    let options = cfg.engine_options().context("engine options")?;

    let (mut engine, recorder) = if cli.dry_run {
        info!("dry run, no hardware will be touched");
        let (engine, state) = dry_run_engine(&cfg, &options)?;
        (engine, Some(state))
    } else {
        let profile = device::detect(&cfg.probe()).context("detecting device")?;
        let engine = EinkEngine::open(profile, &options).context("opening framebuffer")?;
        (engine, None)
    };

    let command = cli.command.clone().unwrap_or(Command::Info);
    let outcome = match command {
        Command::Info => {
            print_info(&engine);
            Ok(())
        }
        Command::Clear { no_wait } => engine.clear_screen(!no_wait).context("clearing screen"),
        Command::Refresh { x, y, width, height, waveform } => {
            let region = Rectangle::new(Point::new(x, y), Size::new(width, height));
            engine.manual_refresh(region, waveform).context("queueing refresh")
        }
    };

    engine.wait_idle();
    let stats = engine.stats();
    if stats.failed > 0 {
        warn!("{} refresh(es) failed, last: {}", stats.failed, stats.last_error.as_deref().unwrap_or("?"));
    }
    info!("{} refresh(es) executed, {} recovered from a frozen panel", stats.executed, stats.recovered);

    if let Some(state) = recorder {
        let state = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for update in &state.updates {
            let flash = if update.flashing { " flash" } else { "" };
            let inverted = if update.inverted { " inverted" } else { "" };
            println!("update #{:<4} {:?} {}{}{}", update.marker, update.region, update.waveform, flash, inverted);
        }
    }

    engine.shutdown();

    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}
