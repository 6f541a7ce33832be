use anyhow::Context;
use clap::Parser;
use obsdeck_daemon::{
    work_queue, Config, ConfigError, Device, IconHandle, IconSet, Image, KeyImage, KeyPos,
    Remote, Renderer, SessionEngine, Transport, WorkItem,
};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "obsdeckd", about = "Mirror remote scene state onto a keypad")]
struct Args {
    #[arg(long, short, value_name = "PATH", default_value = "obsdeck.toml")]
    config: PathBuf,

    /// Overrides `obs.server`.
    #[arg(long)]
    server: Option<String>,

    /// Overrides `obs.port`.
    #[arg(long)]
    port: Option<u16>,

    #[arg(long, env = "OBSDECK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Keypad columns of the headless device.
    #[arg(long, default_value_t = 5)]
    columns: u32,

    /// Substitute placeholders for icon files that cannot be read.
    #[arg(long, default_value_t = false)]
    placeholder_icons: bool,
}

/// Keypad stand-in: key images go to the log, presses come from stdin as
/// `row column` or `page row column`.
struct HeadlessDevice {
    columns: u32,
    next_handle: AtomicU32,
    page: Mutex<u32>,
    pressed: Mutex<Option<KeyPos>>,
}

impl HeadlessDevice {
    fn new(columns: u32) -> Self {
        Self {
            columns,
            next_handle: AtomicU32::new(1),
            page: Mutex::new(0),
            pressed: Mutex::new(None),
        }
    }

    fn index(&self, pos: KeyPos) -> usize {
        ((pos.row - 1) * self.columns + (pos.column - 1)) as usize
    }

    /// Blocks on stdin. `None` at end of input.
    fn next_press(&self) -> Option<KeyPos> {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                return None;
            };
            let nums: Vec<u32> = line
                .split_whitespace()
                .filter_map(|n| n.parse().ok())
                .collect();
            let (page, row, column) = match nums[..] {
                [row, column] => (self.page.lock().map(|p| *p).unwrap_or(0), row, column),
                [page, row, column] => (page, row, column),
                _ => {
                    warn!(%line, "expected `row column` or `page row column`");
                    continue;
                }
            };
            if row == 0 || column == 0 || column > self.columns {
                warn!(row, column, "no such key");
                continue;
            }
            if let Ok(mut p) = self.page.lock() {
                *p = page;
            }
            return Some(KeyPos { page, row, column });
        }
        None
    }
}

impl Device for HeadlessDevice {
    fn set_key_image(&self, pos: KeyPos, image: KeyImage) {
        match image {
            KeyImage::Handle(handle) => debug!(?pos, icon = handle.0, "key"),
            KeyImage::Image(image) => {
                debug!(?pos, label = %String::from_utf8_lossy(&image.data), "key")
            }
        }
    }

    fn register_image(&self, _image: Image) -> IconHandle {
        IconHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Alternates a press read from stdin with the matching release.
    fn read(&self) -> Vec<bool> {
        let Ok(mut pressed) = self.pressed.lock() else {
            return Vec::new();
        };
        if let Some(pos) = pressed.take() {
            return vec![false; self.index(pos) + 1];
        }
        match self.next_press() {
            Some(pos) => {
                let mut keys = vec![false; self.index(pos) + 1];
                keys[self.index(pos)] = true;
                *pressed = Some(pos);
                keys
            }
            None => Vec::new(),
        }
    }

    fn set_brightness(&self, percent: u8) {
        info!(percent, "brightness");
    }
}

/// Writes the label text instead of drawing glyphs.
struct TextRenderer;

impl Renderer for TextRenderer {
    fn render_label(
        &mut self,
        _font: &str,
        _background: &Image,
        lines: &[String],
        _color: &str,
        _anchor: (f64, f64),
    ) -> Option<Image> {
        Some(Image {
            data: lines.join(" / ").into_bytes(),
        })
    }
}

fn load_icon(path: &Path, placeholder: bool) -> Result<Image, ConfigError> {
    match std::fs::read(path) {
        Ok(data) => Ok(Image { data }),
        Err(e) if placeholder => {
            debug!(path = %path.display(), "placeholder icon: {e}");
            Ok(Image {
                data: path.to_string_lossy().into_owned().into_bytes(),
            })
        }
        Err(e) => Err(ConfigError::Invalid(format!("icon {}: {e}", path.display()))),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut transport_config = config.transport();
    if let Some(server) = args.server.clone() {
        transport_config.server = server;
    }
    if let Some(port) = args.port {
        transport_config.port = port;
    }
    if args.password.is_some() {
        transport_config.password = args.password.clone();
    }

    let device = Arc::new(HeadlessDevice::new(args.columns));
    device.set_brightness(config.device.brightness);

    let mut icons = IconSet::new();
    let placeholder = args.placeholder_icons;
    let (buttons, common) = config
        .build_buttons(device.as_ref(), &mut icons, |path| load_icon(path, placeholder))
        .context("building buttons")?;
    info!(buttons = buttons.len(), "keypad configured");

    let (queue, work_rx) = work_queue(config.log_unknown());
    info!(
        server = %transport_config.server,
        port = transport_config.port,
        "connecting"
    );
    let transport = Arc::new(Transport::start(transport_config, Arc::new(queue.clone())));
    let remote: Arc<dyn Remote> = transport.clone();

    let mut engine = SessionEngine::new(
        remote,
        device.clone(),
        Box::new(TextRenderer),
        buttons,
        icons,
        common,
        &config.obs.ftb_scene,
    )
    .spawn(work_rx)
    .context("starting session engine")?;

    // Key presses are edge triggered: only a released -> pressed change counts.
    let mut previous: Vec<bool> = Vec::new();
    loop {
        let keys = device.read();
        if keys.is_empty() {
            break;
        }
        for (idx, &down) in keys.iter().enumerate() {
            if down && !previous.get(idx).copied().unwrap_or(false) {
                let idx = idx as u32;
                let pos = KeyPos {
                    page: device.page.lock().map(|p| *p).unwrap_or(0),
                    row: idx / device.columns + 1,
                    column: idx % device.columns + 1,
                };
                queue.push(WorkItem::KeyPressed { pos });
            }
        }
        previous = keys;
    }

    info!("input closed, shutting down");
    transport.terminate();
    engine.shutdown();
    Ok(())
}
