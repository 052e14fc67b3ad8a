//! # FLUTE - File Delivery over Unidirectional Transport
//!
//! Reliable one-to-many file delivery over UDP/IP multicast, without a
//! return channel.
//!
//! # RFC
//!
//! | RFC      | Title      | Link       |
//! | ------------- | ------------- | ------------- |
//! | RFC 6726 | FLUTE - File Delivery over Unidirectional Transport | <https://www.rfc-editor.org/rfc/rfc6726.html> |
//! | RFC 5775 | Asynchronous Layered Coding (ALC) Protocol Instantiation | <https://www.rfc-editor.org/rfc/rfc5775.html> |
//! | RFC 5651 | Layered Coding Transport (LCT) Building Block | <https://www.rfc-editor.org/rfc/rfc5651.html> |
//! | RFC 5052 | Forward Error Correction (FEC) Building Block | <https://www.rfc-editor.org/rfc/rfc5052> |
//! | RFC 5053 | Raptor Forward Error Correction Scheme | <https://www.rfc-editor.org/rfc/rfc5053.html> |
//!
//! # Session level usage
//!
//! The [`sender::Transmitter`] and [`receiver::Receiver`] engines own the
//! sockets and timers of one session on an injected tokio runtime. The
//! sans-I/O session types below them can also be driven directly:
//!
//! ```
//! use flutecast::common::oti::FecScheme;
//! use flutecast::receiver::ReceiverSession;
//! use flutecast::sender::SenderSession;
//!
//! let mut sender = SenderSession::new(1, 1428, FecScheme::CompactNoCode, 5).unwrap();
//! let url = url::Url::parse("file:///hello.txt").unwrap();
//! sender.send(&url, "text/plain", 0, b"hello world".to_vec(), 0).unwrap();
//!
//! let mut receiver = ReceiverSession::new(1);
//! while let Some(pkt) = sender.next_packet() {
//!     for object in receiver.push(&pkt.data, true).unwrap() {
//!         println!("received {}", object.lock().unwrap().meta().content_location);
//!     }
//!     sender.mark_sent(pkt.toi, &pkt.symbols, true, 0).unwrap();
//! }
//! ```
//!
//! # Engine level usage
//!
//! ```no_run
//! use flutecast::sender::{Config, Transmitter};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let handle = tokio::runtime::Handle::current();
//!     let transmitter =
//!         Transmitter::new("224.0.0.1".parse().unwrap(), 3400, 1, Config::default(), &handle)
//!             .unwrap();
//!     transmitter.register_completion_callback(|toi| println!("TOI {} transmitted", toi));
//!
//!     let url = url::Url::parse("file:///hello.txt").unwrap();
//!     let expires = Transmitter::seconds_since_epoch() + 60;
//!     transmitter
//!         .send(&url, "text/plain", expires, b"hello world".to_vec())
//!         .unwrap();
//! }
//! ```

#![deny(missing_debug_implementations)]

/// ALC/LCT packet and encoding symbol codecs
pub mod common;
/// File Delivery Table model and XML codec
pub mod fdt;
/// FEC scheme capability set and the Raptor transformer
pub mod fec;
/// Boundary to the host IPsec collaborator
pub mod ipsec;
/// One file in transit: partitioning, reassembly, queueing
pub mod object;
/// FLUTE receiver engine and session
pub mod receiver;
/// FLUTE sender engine and session
pub mod sender;

mod tools;

pub use crate::tools::error;
pub use crate::tools::seconds_since_epoch;
pub use crate::tools::unix_to_ntp;
pub use crate::tools::NTP_UNIX_OFFSET;

#[cfg(test)]
mod tests {
    pub fn init() {
        std::env::set_var("RUST_LOG", "debug");
        env_logger::builder().is_test(true).try_init().ok();
    }
}
