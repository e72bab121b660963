#[macro_use]
extern crate serde;
#[macro_use]
extern crate tracing;

mod config;
mod host;
mod loader;
mod log;
mod loopback;

pub use config::{dto, get_data_dir, Conf, ConfHandle};
pub use host::Host;
pub use loader::PluginLibrary;
pub use log::{init_log, LoggerGuard};
pub use loopback::Loopback;
