//! Wire layer between host and worker.
//!
//! # Architecture
//!
//! - **protocol**: `Message`/`Value` types and the reserved command names
//! - **codec**: two-frame layout (command name, versioned payload) for `FramedRead`/`FramedWrite`
//! - **transport**: loopback TCP endpoints, the inbound accept loop and outbound links

pub mod codec;
pub mod protocol;
pub mod transport;
