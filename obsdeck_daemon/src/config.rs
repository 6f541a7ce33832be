//! Daemon configuration loaded from a TOML file.

use crate::backoff::Backoff;
use crate::buttons::{Button, ButtonKind, ButtonRegistry, CommonIcons, LabelStyle};
use crate::device::{Device, IconSet, Image, KeyPos};
use crate::error::ConfigError;
use crate::transport::{TransportConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub obs: ObsConfig,
    pub device: DeviceConfig,
    pub icons: IconConfig,
    #[serde(rename = "button")]
    pub buttons: Vec<ButtonConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObsConfig {
    pub server: String,
    pub port: u16,
    pub password: Option<String>,
    /// Comma separated: `events` logs raw frames, `unknown` logs unhandled events.
    pub log: String,
    /// Reserved scene used by fade-to-black.
    pub ftb_scene: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Percent, 0..=100.
    pub brightness: u8,
    pub pages: u32,
}

/// Icons shared by every button, relative to `dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IconConfig {
    pub dir: String,
    pub offline: String,
    pub unused: String,
    /// Per-kind replacements for `unused`.
    pub live_unused: Option<String>,
    pub preview_unused: Option<String>,
    pub source_unused: Option<String>,
    pub transition_unused: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonConfig {
    #[serde(default)]
    pub page: u32,
    pub row: u32,
    pub column: u32,
    pub function: String,
    #[serde(default)]
    pub nr: u32,
    pub icon1: String,
    pub icon2: Option<String>,
    pub font: Option<String>,
    pub color: Option<String>,
    pub center: Option<[f64; 2]>,
    #[serde(default)]
    pub frames: Vec<String>,
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            port: DEFAULT_PORT,
            password: None,
            log: String::new(),
            ftb_scene: "Black".into(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            brightness: 100,
            pages: 1,
        }
    }
}

impl Default for IconConfig {
    fn default() -> Self {
        Self {
            dir: ".".into(),
            offline: "obs.png".into(),
            unused: "unused.png".into(),
            live_unused: None,
            preview_unused: None,
            source_unused: None,
            transition_unused: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.obs.server.is_empty() {
            return Err(ConfigError::Invalid("obs.server is empty".into()));
        }
        if self.device.brightness > 100 {
            return Err(ConfigError::Invalid(format!(
                "device.brightness {} exceeds 100",
                self.device.brightness
            )));
        }
        for (idx, button) in self.buttons.iter().enumerate() {
            let Some(kind) = ButtonKind::from_function(&button.function) else {
                return Err(ConfigError::Invalid(format!(
                    "button {idx}: unknown function {:?}",
                    button.function
                )));
            };
            if button.row == 0 || button.column == 0 {
                return Err(ConfigError::Invalid(format!(
                    "button {idx}: row and column are 1-based"
                )));
            }
            if button.page >= self.device.pages {
                return Err(ConfigError::Invalid(format!(
                    "button {idx}: page {} but only {} pages",
                    button.page, self.device.pages
                )));
            }
            if kind.uses_ordinal() && button.nr == 0 {
                return Err(ConfigError::Invalid(format!(
                    "button {idx}: {} needs nr >= 1",
                    button.function
                )));
            }
        }
        Ok(())
    }

    fn log_flag(&self, flag: &str) -> bool {
        self.obs.log.split(',').any(|f| f.trim() == flag)
    }

    pub fn log_unknown(&self) -> bool {
        self.log_flag("unknown")
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            server: self.obs.server.clone(),
            port: self.obs.port,
            password: self.obs.password.clone().filter(|p| !p.is_empty()),
            log_events: self.log_flag("events"),
            backoff: Backoff::default(),
            ..TransportConfig::default()
        }
    }

    /// Registers every icon with `device` and builds the button registry.
    /// `load` reads one image by file name relative to `icons.dir`.
    pub fn build_buttons(
        &self,
        device: &dyn Device,
        icons: &mut IconSet,
        mut load: impl FnMut(&Path) -> Result<Image, ConfigError>,
    ) -> Result<(ButtonRegistry, CommonIcons), ConfigError> {
        let dir = Path::new(&self.icons.dir);
        let mut icon = |name: &str| -> Result<_, ConfigError> {
            match icons.lookup(name) {
                Some(handle) => Ok(handle),
                None => {
                    let image = load(&dir.join(name))?;
                    Ok(icons.register(device, name, image))
                }
            }
        };

        let offline = icon(&self.icons.offline)?;
        let unused = self.icons.unused.as_str();
        let mut unused_for = |name: &Option<String>| icon(name.as_deref().unwrap_or(unused));
        let common = CommonIcons {
            offline,
            unused: unused_for(&None)?,
            live_unused: unused_for(&self.icons.live_unused)?,
            preview_unused: unused_for(&self.icons.preview_unused)?,
            source_unused: unused_for(&self.icons.source_unused)?,
            transition_unused: unused_for(&self.icons.transition_unused)?,
        };

        let mut registry = ButtonRegistry::new();
        for cfg in &self.buttons {
            let kind = ButtonKind::from_function(&cfg.function)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown function {:?}", cfg.function)))?;
            let active = icon(&cfg.icon1)?;
            let inactive = match &cfg.icon2 {
                Some(name) => icon(name)?,
                None => active,
            };
            let mut button = Button::new(
                kind,
                KeyPos {
                    page: cfg.page,
                    row: cfg.row,
                    column: cfg.column,
                },
                cfg.nr,
                active,
                inactive,
            );
            let defaults = LabelStyle::default();
            button.label = LabelStyle {
                font: cfg.font.clone().unwrap_or(defaults.font),
                color: cfg.color.clone().unwrap_or(defaults.color),
                center: cfg.center.map(|[x, y]| (x, y)).unwrap_or(defaults.center),
            };
            for frame in &cfg.frames {
                button.frames.push(icon(frame)?);
            }
            registry.add(button);
        }
        Ok((registry, common))
    }
}
