//! # tuya-local
//!
//! Asynchronous engine for the Tuya local protocol (3.1, 3.3, 3.4 and 3.5):
//! frame codec, session key negotiation, heartbeats with reconnect, and
//! schema-mapped datapoint control without cloud round trips.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuya_local::{DeviceBuilder, DpSchema, DpType, SchemaDp, Version};
//!
//! # async fn run() -> tuya_local::Result<()> {
//! let device = DeviceBuilder::new("DEVICE_ID", "0123456789abcdef")
//!     .address("192.168.1.20")
//!     .version(Version::V3_4)
//!     .schema(DpSchema::new(vec![SchemaDp::new(1, "switch_1", DpType::Boolean)]))
//!     .start()?;
//! device.send_command("switch_1", true).await?;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod codec;
pub mod crypto;
pub mod device;
pub mod error;
pub mod payload;
pub mod protocol;
pub mod schema;
pub mod session;
pub mod transport;

pub use codec::{Frame, FrameCodec, MessageWrapper};
pub use device::{Device, DeviceBuilder, DeviceEvent, StatusMap};
pub use error::{Result, TuyaError};
pub use payload::DpMap;
pub use protocol::{CommandType, Version};
pub use schema::{DpSchema, DpType, SchemaDp, SchemaRegistry};
pub use session::{Phase, SessionConfig, SessionEvent, SessionHandle};
pub use transport::{Connector, TcpConnector};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
