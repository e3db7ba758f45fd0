//! Control plane state for tunnel orchestration
pub mod channel;
pub mod pending_requests;
pub mod port_allocator;

pub use channel::{
    ChannelError, ControlChannel, ControlReceiver, ControlSender, DEFAULT_CHANNEL_CAPACITY,
};
pub use pending_requests::{generate_token, PendingRequest, PendingRequests};
pub use port_allocator::{PortAllocator, PortAllocatorError};
