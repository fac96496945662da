//! Reconnecting client for the board event stream.

pub mod client;
pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod listeners;
pub mod transport;

pub use client::StreamClient;
pub use config::{ClientConfig, Method};
pub use control::ControlClient;
pub use controller::{ConnectionState, Next, ReconnectController};
pub use error::{ClientError, CloseReason};
pub use transport::{ByteStream, HttpTransport, StreamTransport};
