pub mod codec;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod entity;
pub mod env;
pub mod event_loop;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod trace;
pub mod transport;

pub use event_loop::{BridgeEventLoop, BridgeHandle};
pub use transport::{BridgeChannels, ConnectionId};
