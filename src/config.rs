use serde::{Deserialize, Serialize};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use dirs_next::home_dir;
use std::{fs, path::{Path, PathBuf}, time::Duration};
use thiserror::Error;

use crate::display::cursor::{CursorConfig, CursorSprite};
use crate::display::device::DeviceProbe;
use crate::display::engine::EngineOptions;
use crate::display::waveform::WaveformId;

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// Error type for config loading/validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// General options
    pub log_level: Option<String>,     // e.g., "info" | "debug"
    /// Skip codename detection
    pub codename: Option<String>,
    /// refresh pipeline behavior
    pub engine: Option<EngineConfig>,
    /// pointer tracking; off unless present and enabled
    pub cursor: Option<CursorSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    pub fb_device: Option<PathBuf>,
    pub bpp: Option<u32>,              // 8 | 16 | 24 | 32
    pub rotate: Option<u32>,           // 0..=3
    pub flashing: Option<bool>,
    pub software_dither: Option<bool>,
    pub hardware_dither: Option<bool>,
    pub explicit_wait: Option<bool>,
    pub waveforms: Option<WaveformConfig>,
}

/// Waveform overrides, by mode name (GC16, REAGL, A2, ...)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WaveformConfig {
    pub fullscreen: Option<WaveformId>,
    pub partial: Option<WaveformId>,
    pub fast: Option<WaveformId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CursorSection {
    pub enabled: Option<bool>,
    pub slow_ms: Option<u64>,
    pub fast_ms: Option<u64>,
    pub cycles_until_slow: Option<u32>,
    pub fallback_size: Option<u32>,
    /// PNG or PNM drawn while the pointer rests, alpha is transparency
    pub standby_image: Option<PathBuf>,
}

/// CLI overrides. All fields are Options so we can layer them over YAML.
#[derive(Debug, Parser, Clone)]
#[command(name = "einkd", version, about = "e-ink refresh engine for mxcfb readers")]
pub struct Cli {
    /// Path to a YAML config file (overrides search)
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    /// shorthand for --log-level debug
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub debug: bool,
    #[arg(long)]
    pub codename: Option<String>,
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub fb_device: Option<PathBuf>,
    #[arg(long)]
    pub bpp: Option<u32>,
    #[arg(long)]
    pub rotate: Option<u32>,
    #[arg(long, action = ArgAction::Set)]
    pub flashing: Option<bool>,
    #[arg(long, action = ArgAction::Set)]
    pub software_dither: Option<bool>,
    #[arg(long, action = ArgAction::SetTrue)]
    pub explicit_wait: bool,
    /// run against an in-memory panel, no hardware touched
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,
    /// dump fully merged config (after overrides) and exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub dump_config: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum Command {
    /// Print the device profile and the waveform set in use
    Info,
    /// Flash the whole panel white
    Clear {
        /// return without waiting for the panel
        #[arg(long, action = ArgAction::SetTrue)]
        no_wait: bool,
    },
    /// Refresh one rectangle of the framebuffer
    Refresh {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        /// force a waveform (GC16, DU, A2, ...)
        #[arg(long)]
        waveform: Option<WaveformId>,
    },
}

/// Public entry point: parse CLI, read YAML, merge, validate.
pub fn load() -> Result<(Cli, Config), ConfigError> {
    let cli = Cli::parse();
    let cfg = load_from(&cli)?;
    Ok((cli, cfg))
}

/// Build the effective config for an already parsed command line.
pub fn load_from(cli: &Cli) -> Result<Config, ConfigError> {
    // 1) defaults (from `Default` impl)
    let mut cfg = Config::default();

    // 2) YAML file (explicit path or search)
    if let Some(p) = cli.config.as_ref() {
        if p.exists() {
            let y = read_yaml(p)?;
            merge(&mut cfg, y);
        } else {
            return Err(ConfigError::Validation(format!(
                "Config file not found: {}",
                p.display()
            )));
        }
    } else if let Some(p) = find_config_file() {
        let y = read_yaml(&p)?;
        merge(&mut cfg, y);
    }

    // 3) CLI overrides (highest precedence)
    apply_cli_overrides(&mut cfg, cli);

    // 4) Validate
    validate(&cfg)?;

    Ok(cfg)
}

/// Pretty YAML of effective config (nice for debugging)
pub fn to_yaml(cfg: &Config) -> Result<String, ConfigError> {
    Ok(serde_yaml::to_string(cfg)?)
}

/// Try common locations in order (first hit wins).
fn find_config_file() -> Option<PathBuf> {
    // XDG-style: ~/.config/einkd/config.yaml
    if let Some(home) = home_dir() {
        let p = home.join(".config/einkd/config.yaml");
        if p.exists() { return Some(p) }
        let p = home.join(".config/einkd.yaml");
        if p.exists() { return Some(p) }
    }
    // working directory, e.g. the onboard partition
    for candidate in &["einkd.yaml", "config.yaml", "config/einkd.yaml"] {
        let p = PathBuf::from(candidate);
        if p.exists() { return Some(p) }
    }
    None
}

fn read_yaml(path: &Path) -> Result<Config, ConfigError> {
    let s = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&s)?;
    Ok(cfg)
}

/// Shallow merge `src` into `dst`, Option-by-Option.
fn merge(dst: &mut Config, src: Config) {
    // top-level
    if src.log_level.is_some()      { dst.log_level = src.log_level; }
    if src.codename.is_some()       { dst.codename = src.codename; }
    match (&mut dst.engine, src.engine) {
        (None, Some(c)) => dst.engine = Some(c),
        (Some(d), Some(s)) => merge_engine(d, s),
        _ => {}
    }
    match (&mut dst.cursor, src.cursor) {
        (None, Some(c)) => dst.cursor = Some(c),
        (Some(d), Some(s)) => merge_cursor(d, s),
        _ => {}
    }
}

fn merge_engine(dst: &mut EngineConfig, src: EngineConfig) {
    if src.fb_device.is_some()       { dst.fb_device = src.fb_device; }
    if src.bpp.is_some()             { dst.bpp = src.bpp; }
    if src.rotate.is_some()          { dst.rotate = src.rotate; }
    if src.flashing.is_some()        { dst.flashing = src.flashing; }
    if src.software_dither.is_some() { dst.software_dither = src.software_dither; }
    if src.hardware_dither.is_some() { dst.hardware_dither = src.hardware_dither; }
    if src.explicit_wait.is_some()   { dst.explicit_wait = src.explicit_wait; }
    match (&mut dst.waveforms, src.waveforms) {
        (None, Some(w)) => dst.waveforms = Some(w),
        (Some(d), Some(s)) => {
            if s.fullscreen.is_some() { d.fullscreen = s.fullscreen; }
            if s.partial.is_some()    { d.partial = s.partial; }
            if s.fast.is_some()       { d.fast = s.fast; }
        }
        _ => {}
    }
}

fn merge_cursor(dst: &mut CursorSection, src: CursorSection) {
    if src.enabled.is_some()           { dst.enabled = src.enabled; }
    if src.slow_ms.is_some()           { dst.slow_ms = src.slow_ms; }
    if src.fast_ms.is_some()           { dst.fast_ms = src.fast_ms; }
    if src.cycles_until_slow.is_some() { dst.cycles_until_slow = src.cycles_until_slow; }
    if src.fallback_size.is_some()     { dst.fallback_size = src.fallback_size; }
    if src.standby_image.is_some()     { dst.standby_image = src.standby_image; }
}

fn apply_cli_overrides(cfg: &mut Config, cli: &Cli) {
    if cli.debug                     { cfg.log_level = Some("debug".into()); }
    if cli.log_level.is_some()       { cfg.log_level = cli.log_level.clone(); }
    if cli.codename.is_some()        { cfg.codename = cli.codename.clone(); }

    let any_engine = cli.fb_device.is_some()
        || cli.bpp.is_some()
        || cli.rotate.is_some()
        || cli.flashing.is_some()
        || cli.software_dither.is_some()
        || cli.explicit_wait;

    if any_engine && cfg.engine.is_none() {
        cfg.engine = Some(EngineConfig::default());
    }
    if let Some(engine) = cfg.engine.as_mut() {
        if cli.fb_device.is_some()       { engine.fb_device = cli.fb_device.clone(); }
        if cli.bpp.is_some()             { engine.bpp = cli.bpp; }
        if cli.rotate.is_some()          { engine.rotate = cli.rotate; }
        if cli.flashing.is_some()        { engine.flashing = cli.flashing; }
        if cli.software_dither.is_some() { engine.software_dither = cli.software_dither; }
        if cli.explicit_wait             { engine.explicit_wait = Some(true); }
    }
}

/// Put any invariants here (required fields, ranges, etc.)
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if let Some(level) = cfg.log_level.as_deref() {
        if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "log_level must be one of {}",
                LOG_LEVELS.join("|")
            )));
        }
    }
    if let Some(engine) = cfg.engine.as_ref() {
        if let Some(bpp) = engine.bpp {
            match bpp {
                8 | 16 | 24 | 32 => {},
                _ => return Err(ConfigError::Validation("engine bpp must be 8|16|24|32".into()))
            }
        }
        if engine.rotate.is_some_and(|r| r > 3) {
            return Err(ConfigError::Validation("engine rotate must be 0..=3".into()));
        }
    }
    if let Some(cursor) = cfg.cursor.as_ref() {
        if cursor.slow_ms == Some(0) || cursor.fast_ms == Some(0) {
            return Err(ConfigError::Validation("cursor intervals must be > 0".into()));
        }
        if cursor.cycles_until_slow == Some(0) {
            return Err(ConfigError::Validation("cursor cycles_until_slow must be >= 1".into()));
        }
        if cursor.fallback_size == Some(0) {
            return Err(ConfigError::Validation("cursor fallback_size must be > 0".into()));
        }
    }
    Ok(())
}

impl Config {
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Detection inputs, honoring the codename and node overrides
    pub fn probe(&self) -> DeviceProbe {
        let mut probe = DeviceProbe {
            codename_override: self.codename.clone(),
            ..DeviceProbe::default()
        };
        if let Some(fb) = self.engine.as_ref().and_then(|e| e.fb_device.clone()) {
            probe.fb_candidates = vec![fb];
        }
        probe
    }

    pub fn cursor_enabled(&self) -> bool {
        self.cursor.as_ref().is_some_and(|c| c.enabled.unwrap_or(true))
    }

    /// Options for the engine, loading the standby image if one is named
    pub fn engine_options(&self) -> Result<EngineOptions, ConfigError> {
        let mut options = EngineOptions::default();

        if let Some(engine) = self.engine.as_ref() {
            options.fb_device = engine.fb_device.clone();
            options.bpp = engine.bpp;
            options.rotate = engine.rotate;
            if let Some(v) = engine.flashing        { options.flashing = v; }
            if let Some(v) = engine.software_dither { options.software_dither = v; }
            if let Some(v) = engine.hardware_dither { options.hardware_dither = v; }
            if let Some(v) = engine.explicit_wait   { options.explicit_wait = v; }
            if let Some(w) = engine.waveforms.as_ref() {
                options.fullscreen_waveform = w.fullscreen;
                options.partial_waveform = w.partial;
                options.fast_waveform = w.fast;
            }
        }

        if let Some(cursor) = self.cursor.as_ref().filter(|_| self.cursor_enabled()) {
            let mut config = CursorConfig::default();
            if let Some(ms) = cursor.slow_ms           { config.slow_interval = Duration::from_millis(ms); }
            if let Some(ms) = cursor.fast_ms           { config.fast_interval = Duration::from_millis(ms); }
            if let Some(n) = cursor.cycles_until_slow  { config.cycles_until_slow = n; }
            if let Some(n) = cursor.fallback_size      { config.fallback_size = n; }
            options.cursor = Some(config);

            if let Some(path) = cursor.standby_image.as_ref() {
                let sprite = CursorSprite::load(path)
                    .map_err(|e| ConfigError::Validation(format!("standby_image: {}", e)))?;
                options.standby_sprite = Some(sprite);
            }
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("einkd").chain(args.iter().copied())).unwrap()
    }

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const SAMPLE: &str = "
log_level: warn
engine:
  bpp: 8
  flashing: false
  waveforms:
    partial: REAGL
cursor:
  slow_ms: 400
";

    #[test]
    fn test_yaml_file_is_read() {
        let file = write_temp(SAMPLE);
        let cfg = load_from(&cli(&["--config", file.path().to_str().unwrap()])).unwrap();

        assert_eq!(cfg.log_level(), "warn");
        let engine = cfg.engine.as_ref().unwrap();
        assert_eq!(engine.bpp, Some(8));
        assert_eq!(engine.waveforms.as_ref().unwrap().partial, Some(WaveformId::Reagl));
        assert_eq!(cfg.cursor.as_ref().unwrap().slow_ms, Some(400));
    }

    #[test]
    fn test_cli_overrides_yaml() {
        let file = write_temp(SAMPLE);
        let cfg = load_from(&cli(&[
            "--config", file.path().to_str().unwrap(),
            "--debug",
            "--flashing", "true",
            "--bpp", "16",
            "--codename", "kraken",
        ])).unwrap();

        assert_eq!(cfg.log_level(), "debug");
        assert_eq!(cfg.codename.as_deref(), Some("kraken"));
        let engine = cfg.engine.unwrap();
        assert_eq!(engine.bpp, Some(16));
        assert_eq!(engine.flashing, Some(true));
        // untouched by the command line
        assert_eq!(engine.waveforms.unwrap().partial, Some(WaveformId::Reagl));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = load_from(&cli(&["--config", "/nonexistent/einkd.yaml"])).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_bad_yaml() {
        let file = write_temp("engine: [1, 2");
        let err = load_from(&cli(&["--config", file.path().to_str().unwrap()])).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_validation() {
        let mut cfg = Config {
            engine: Some(EngineConfig { bpp: Some(12), ..Default::default() }),
            ..Default::default()
        };
        assert!(validate(&cfg).is_err());

        cfg.engine = Some(EngineConfig { rotate: Some(4), ..Default::default() });
        assert!(validate(&cfg).is_err());

        cfg.engine = None;
        cfg.cursor = Some(CursorSection { fast_ms: Some(0), ..Default::default() });
        assert!(validate(&cfg).is_err());

        cfg.cursor = Some(CursorSection { cycles_until_slow: Some(0), ..Default::default() });
        assert!(validate(&cfg).is_err());

        cfg.cursor = None;
        cfg.log_level = Some("chatty".into());
        assert!(validate(&cfg).is_err());

        cfg.log_level = Some("TRACE".into());
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let mut dst = Config {
            engine: Some(EngineConfig { bpp: Some(8), flashing: Some(true), ..Default::default() }),
            ..Default::default()
        };
        merge(&mut dst, Config {
            engine: Some(EngineConfig { flashing: Some(false), ..Default::default() }),
            ..Default::default()
        });
        let engine = dst.engine.unwrap();
        assert_eq!(engine.bpp, Some(8));
        assert_eq!(engine.flashing, Some(false));
    }

    #[test]
    fn test_engine_options() {
        let cfg = Config {
            engine: Some(EngineConfig {
                flashing: Some(false),
                explicit_wait: Some(true),
                waveforms: Some(WaveformConfig { fast: Some(WaveformId::Du), ..Default::default() }),
                ..Default::default()
            }),
            cursor: Some(CursorSection { fast_ms: Some(100), ..Default::default() }),
            ..Default::default()
        };
        let options = cfg.engine_options().unwrap();
        assert!(!options.flashing);
        assert!(options.explicit_wait);
        assert_eq!(options.fast_waveform, Some(WaveformId::Du));
        assert_eq!(options.partial_waveform, None);
        let cursor = options.cursor.unwrap();
        assert_eq!(cursor.fast_interval, Duration::from_millis(100));
        assert_eq!(cursor.slow_interval, Duration::from_millis(300));
    }

    #[test]
    fn test_cursor_disabled() {
        let cfg = Config {
            cursor: Some(CursorSection { enabled: Some(false), ..Default::default() }),
            ..Default::default()
        };
        assert!(!cfg.cursor_enabled());
        assert!(cfg.engine_options().unwrap().cursor.is_none());
        assert!(Config::default().engine_options().unwrap().cursor.is_none());
    }

    #[test]
    fn test_missing_standby_image() {
        let cfg = Config {
            cursor: Some(CursorSection {
                standby_image: Some(PathBuf::from("/nonexistent/standby.png")),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(cfg.engine_options(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_png_standby_image_is_loaded() {
        let file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        let img = image::ImageBuffer::from_pixel(12, 16, image::LumaA([0u8, 255]));
        img.save_with_format(file.path(), image::ImageFormat::Png).unwrap();

        let cfg = Config {
            cursor: Some(CursorSection {
                standby_image: Some(file.path().to_path_buf()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let sprite = cfg.engine_options().unwrap().standby_sprite.unwrap();
        assert_eq!(sprite.pixel(11, 15), Some(0));
    }

    #[test]
    fn test_detection_overrides() {
        let cfg = Config {
            codename: Some("storm".into()),
            engine: Some(EngineConfig { fb_device: Some(PathBuf::from("/dev/fb1")), ..Default::default() }),
            ..Default::default()
        };
        let probe = cfg.probe();
        assert_eq!(probe.codename(), "storm");
        assert_eq!(probe.fb_candidates, vec![PathBuf::from("/dev/fb1")]);
    }

    #[test]
    fn test_subcommands() {
        assert_eq!(cli(&["info"]).command, Some(Command::Info));
        assert_eq!(cli(&["clear", "--no-wait"]).command, Some(Command::Clear { no_wait: true }));
        assert_eq!(
            cli(&["refresh", "10", "20", "30", "40", "--waveform", "A2"]).command,
            Some(Command::Refresh { x: 10, y: 20, width: 30, height: 40, waveform: Some(WaveformId::A2) })
        );
        assert!(Cli::try_parse_from(["einkd", "refresh", "1", "2"]).is_err());
    }

    #[test]
    fn test_dump_yaml() {
        let cfg = Config { log_level: Some("info".into()), ..Default::default() };
        let yaml = to_yaml(&cfg).unwrap();
        assert!(yaml.contains("log_level: info"));
    }
}
