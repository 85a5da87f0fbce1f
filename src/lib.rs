pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod fallback;
pub mod orchestrator;
pub mod transform;
pub mod utils;

pub use codec::{CodecConfig, VqCodec};
pub use config::Opts;
pub use error::{Error, ErrorKind, Result};
pub use orchestrator::{CompressionRequest, CompressionResult, ImageSource, Orchestrator, OutputTarget};
