//! Seams to the collaborators outside the core: the keypad, the label
//! renderer and the remote request API.

use crate::error::TransportError;
use crate::transport::Transport;
use obsdeck_protocol::{BatchEntry, BatchResult};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IconHandle(pub u32);

/// 1-based key coordinate on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyPos {
    pub page: u32,
    pub row: u32,
    pub column: u32,
}

/// Encoded image bytes as handed to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyImage {
    Handle(IconHandle),
    Image(Image),
}

pub trait Device: Send + Sync {
    fn set_key_image(&self, pos: KeyPos, image: KeyImage);
    fn register_image(&self, image: Image) -> IconHandle;
    /// Blocks until the key state changes. One entry per key, true if pressed.
    /// An empty vector means the device went away.
    fn read(&self) -> Vec<bool>;
    fn set_brightness(&self, percent: u8);
}

pub trait Renderer: Send {
    /// Fits `lines` into `background` and composes them at `anchor`
    /// (fractions of width and height). `None` if the text cannot be drawn.
    fn render_label(
        &mut self,
        font: &str,
        background: &Image,
        lines: &[String],
        color: &str,
        anchor: (f64, f64),
    ) -> Option<Image>;
}

/// Request API of the remote application.
pub trait Remote: Send + Sync {
    fn emit(&self, request_type: &str, data: Option<Value>) -> Result<(), TransportError>;
    fn call(&self, request_type: &str, data: Option<Value>) -> Result<Value, TransportError>;
    fn batch(&self, requests: Vec<BatchEntry>) -> Result<Vec<BatchResult>, TransportError>;
}

impl Remote for Transport {
    fn emit(&self, request_type: &str, data: Option<Value>) -> Result<(), TransportError> {
        Transport::emit(self, request_type, data)
    }

    fn call(&self, request_type: &str, data: Option<Value>) -> Result<Value, TransportError> {
        Transport::call(self, request_type, data)
    }

    fn batch(&self, requests: Vec<BatchEntry>) -> Result<Vec<BatchResult>, TransportError> {
        Transport::batch(self, requests)
    }
}

/// Images registered with the device, kept so label backgrounds can be
/// handed to the renderer.
#[derive(Debug, Default)]
pub struct IconSet {
    images: HashMap<IconHandle, Image>,
    by_name: HashMap<String, IconHandle>,
}

impl IconSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `image` under `name` once; later calls return the same handle.
    pub fn register(&mut self, device: &dyn Device, name: &str, image: Image) -> IconHandle {
        if let Some(&handle) = self.by_name.get(name) {
            return handle;
        }
        let handle = device.register_image(image.clone());
        self.images.insert(handle, image);
        self.by_name.insert(name.to_string(), handle);
        handle
    }

    pub fn lookup(&self, name: &str) -> Option<IconHandle> {
        self.by_name.get(name).copied()
    }

    pub fn image(&self, handle: IconHandle) -> Option<&Image> {
        self.images.get(&handle)
    }
}
