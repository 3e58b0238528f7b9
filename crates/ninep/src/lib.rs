#![forbid(unsafe_code)]
//! Asynchronous 9P2000 client and server library for Rust.
//!
//! This crate provides a tokio-based implementation of the plain 9P2000
//! protocol (the original Plan 9 file protocol, not the Linux-specific
//! 9P2000.L dialect): a wire codec, a length-prefixed framer, a client
//! multiplexer, and a server dispatcher you plug a [`srv::Filesystem`] into.
//!
//! # Overview
//!
//! 9P represents every resource — files, directories, devices, synthetic
//! control files — as a flat namespace of fids navigated by `walk` and
//! manipulated by `open`/`read`/`write`/`create`/`remove`/`stat`/`wstat`.
//! A single connection can serve many concurrent requests, distinguished
//! by a 16-bit tag chosen by the client.
//!
//! # Getting Started — server
//!
//! 1. Define a type to represent your per-fid state (or use `()`).
//! 2. Implement [`srv::Filesystem`] for your filesystem type.
//! 3. Start the server with [`srv::srv_async`].
//!
//! ```no_run
//! use ninep::{srv::{Filesystem, FId, srv_async}, Result, FCall, QId, QIdType};
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type FId = ();
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &FId<Self::FId>,
//!         _afid: Option<&FId<Self::FId>>,
//!         _uname: &str,
//!         _aname: &str,
//!     ) -> Result<FCall> {
//!         Ok(FCall::RAttach {
//!             qid: QId { typ: QIdType::DIR, version: 0, path: 0 },
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let fs = MyFs;
//!     srv_async(fs, "tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Getting Started — client
//!
//! [`client::Client`] connects, negotiates a protocol version, and exposes
//! `walk`/`open`/`create`/`read`/`write`/`stat`/`remove`/`clunk` on top of a
//! shared connection multiplexer — many concurrent callers, one socket.
//!
//! # Message Flow
//!
//! 1. **Version negotiation**: `TVersion`/`RVersion`.
//! 2. **Attach**: `TAttach` binds a fid to the filesystem root.
//! 3. **Operations**: `walk`, `open`, `read`, `write`, etc.
//! 4. **Cleanup**: `TClunk` releases a fid's resources.
//!
//! **Fid invariants:**
//! - Each fid is unique per connection.
//! - Fids persist across operations until explicitly clunked.
//! - Walking to a `newfid` creates a new fid; the source fid remains valid.
//! - After `TClunk`/`TRemove`, the fid is invalid.
//!
//! # Error Handling
//!
//! Handlers return [`error::Error`]; the dispatcher renders it to the
//! literal 9P2000 error string carried by `RError`.
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` (e.g. `"tcp!0.0.0.0!564"`)
//! - **Unix domain sockets**: `"unix!/path/to/socket"`
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod client;
pub mod error;
pub mod fcall;
pub mod pending;
pub mod serialize;
pub mod srv;
pub mod transport;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
