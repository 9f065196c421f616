pub mod ampart;
pub mod bootloader;
pub mod config;
pub mod error;
pub mod executor;
pub mod layout;
pub mod log_sanitize;
pub mod pipeline;
pub mod registry;
pub mod release;
pub mod resolver;
pub mod session;
pub mod storage;
pub mod ui;
pub mod util;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
