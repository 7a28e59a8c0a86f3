//! # Core Framing Components
//!
//! Low-level packet handling for the debugging wire format.
//!
//! ## Components
//! - **Segment**: Fixed-length, delimited and stream-handoff pieces of a packet
//! - **Packet**: JSON and bulk packets assembled from segments
//! - **Codec**: Tokio codec for framing over byte streams
//! - **StreamCopier**: Exact-length copies for bulk bodies
//!
//! ## Wire Format
//! ```text
//! <length>:<json>
//! bulk <actor> <type> <length>:<raw bytes>
//! ```
//!
//! ## Limits
//! - The length field must end within 20 bytes
//! - Declared JSON payloads above the configured maximum are rejected before allocation

pub mod codec;
pub mod packet;
pub mod segment;
pub mod stream_copier;
