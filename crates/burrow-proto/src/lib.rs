//! Burrow Protocol Definitions
//!
//! Wire types shared by the broker, its management API and tunnel agents:
//! control-channel packets, provisioning payloads and IP filters.

pub mod filter;
pub mod messages;
pub mod models;

pub use filter::{Filter, FilterError, FilterType};
pub use messages::*;
pub use models::*;

/// First port of the default public/rendezvous port range
pub const DEFAULT_PORT_START: u16 = 10000;

/// Last port (inclusive) of the default port range
pub const DEFAULT_PORT_END: u16 = 60000;

/// Copy buffer size used by each byte pump direction
pub const DEFAULT_BUFFER_SIZE: usize = 30000;

/// Number of random bytes behind a tunnel token
pub const TOKEN_BYTES: usize = 128;

/// Length of a token once base64 (URL-safe, padded) encoded
pub const TOKEN_LENGTH: usize = TOKEN_BYTES.div_ceil(3) * 4;
