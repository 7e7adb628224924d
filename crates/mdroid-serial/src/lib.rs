//! `mdroid-serial` – the microcontroller side of the hub.
//!
//! # Modules
//!
//! - [`codec`] – splits the inbound byte stream into JSON frames and
//!   normalises their values into the store's canonical strings.
//! - [`transport`] – the [`Connector`]/[`Transport`] seam, with a
//!   `serialport` implementation and an in-memory mock.
//! - [`link`] – [`SerialLink`]: one connection's read loop and outbound
//!   queue.
//! - [`manager`] – [`LinkManager`]: supervision, reconnects, and the single
//!   writer role.
//! - [`sink`] – [`CommandSink`]: how policy code sends commands.

pub mod codec;
pub mod error;
pub mod link;
pub mod manager;
pub mod sink;
pub mod transport;

pub use codec::{DecodeError, FrameReader, FrameValue, apply_frame, decode_frame};
pub use error::LinkError;
pub use link::{LinkState, SerialLink};
pub use manager::{LinkConfig, LinkManager};
pub use sink::CommandSink;
pub use transport::{Connector, SerialConnector, Transport};
