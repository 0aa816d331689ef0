//! Network transport
//!
//! [`LanChannelService`] discovers peers and produces authenticated
//! [`Channel`]s. Other backends can plug in through [`ChannelService`].

pub mod channel;
pub mod lan;
pub mod tls;
pub mod tls_config;

pub use channel::{Channel, ChannelParts, CLOSE_TIMEOUT};
pub use lan::{ChannelService, LanChannelService, ServiceConfig, ServiceEvent};
