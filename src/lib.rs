//! # devtools-transport
//!
//! Packet transport and actor routing for a remote debugging protocol.
//!
//! ## Layers
//! - [`core`]: the wire format. JSON packets (`<length>:<json>`) and bulk
//!   packets (`bulk <actor> <type> <length>:<bytes>`) built from segments
//! - [`transport`]: moves packets over a byte stream, within one process,
//!   or across a parent/child message channel
//! - [`router`]: correlates requests with replies, tracks where actors came
//!   from, and mirrors one connection's requests onto its siblings
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use devtools_transport::error::CloseReason;
//! use devtools_transport::transport::{stream::DebuggerTransport, PacketHooks, SharedPacket, Transport};
//!
//! struct Printer;
//!
//! impl PacketHooks for Printer {
//!     fn on_packet(&self, packet: SharedPacket) {
//!         println!("{packet}");
//!     }
//!
//!     fn on_closed(&self, reason: &CloseReason) {
//!         println!("closed: {reason}");
//!     }
//! }
//!
//! # async fn demo() -> devtools_transport::error::Result<()> {
//! let (client, _server) = tokio::io::duplex(64 * 1024);
//! let transport = DebuggerTransport::from_stream(client);
//! transport.set_hooks(Some(Arc::new(Printer)));
//! transport.ready()?;
//! transport.send(serde_json::json!({"to": "root", "type": "listTabs"}))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod router;
pub mod transport;
pub mod utils;

pub use config::DevtoolsConfig;
pub use error::{CloseReason, ProtocolError, Result};
pub use router::{Bootstrap, ConnectionId, RoutedConnection, Router};
pub use transport::{PacketHooks, SharedPacket, Transport};
