// Copyright 2020-2022 The NATS Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tail the messages flowing through a NATS subject.
//!
//! `nats-tail` connects to one or more NATS servers, subscribes to a subject
//! (wildcards allowed) and prints every matching message as a single line,
//! keeping the `|` separators aligned across subjects of different lengths.
//!
//! The crate has two halves:
//!
//! * [`Tail`], a single subscription on top of the [`nats`] client;
//! * the [`display::Engine`] that turns a message into a line of text.
//!
//! ## Examples
//!
//! `> cargo run -- -s demo.nats.io "docker.>"`
//!
//! ```no_run
//! # fn main() -> std::io::Result<()> {
//! use nats_tail::display::{Engine, OutputFormat};
//! use nats_tail::{Tail, TransportConfig};
//!
//! let config = TransportConfig {
//!     servers: "demo.nats.io".to_string(),
//!     ..TransportConfig::default()
//! };
//! let tail = Tail::start(&config, "docker.>")?;
//!
//! let mut engine = Engine::new(OutputFormat::Raw, false);
//! let stdout = std::io::stdout();
//! for msg in tail.messages() {
//!     engine.render(&msg.subject, &msg.data, &mut stdout.lock())?;
//! }
//! # Ok(()) }
//! ```

#![deny(
    future_incompatible,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    trivial_numeric_casts
)]
#![deny(
    clippy::cast_lossless,
    clippy::doc_markdown,
    clippy::explicit_iter_loop,
    clippy::if_not_else,
    clippy::needless_borrow,
    clippy::print_stdout,
    clippy::string_add,
    clippy::unimplemented,
    clippy::wildcard_dependencies
)]

/// Rendering of received messages as aligned, optionally colored lines.
pub mod display;
mod transport;

pub use transport::{Tail, TransportConfig};

/// The version of this crate, as reported by `nats-tail -v`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server used when none is given.
pub const DEFAULT_URL: &str = "nats://127.0.0.1:4222";
