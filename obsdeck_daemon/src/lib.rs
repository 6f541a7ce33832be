pub mod backoff;
pub mod buttons;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod mock;
mod net;
pub mod state;
pub mod transport;
pub mod work;

pub use buttons::{Button, ButtonClass, ButtonKind, ButtonRegistry, CommonIcons, RenderInstruction};
pub use config::Config;
pub use device::{Device, IconHandle, IconSet, Image, KeyImage, KeyPos, Remote, Renderer};
pub use engine::{EngineHandle, SessionEngine};
pub use error::{ConfigError, TransportError};
pub use transport::{ConnectionState, Transport, TransportConfig, TransportObserver};
pub use work::{work_queue, WorkItem, WorkQueue};
