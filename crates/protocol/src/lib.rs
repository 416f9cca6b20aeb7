//! # Korelink Protocol Library
//!
//! Wire-level building blocks for the game protocol spoken between the real
//! client, the agent and the upstream servers.
//!
//! ## Wire format
//!
//! Every frame starts with a little-endian u16 message identifier. The rest
//! of the frame is either a registry-declared fixed length (counting the
//! identifier) or variable, in which case a little-endian u16 length field
//! follows the identifier and counts the identifier, itself and the payload.
//!
//! ```text
//! 9A 00 09 00 68 69 00
//! ^^^^^ ^^^^^ ^^^^^^^^
//! id    len   "hi\0"
//! ```
//!
//! ## Layers
//!
//! ### 1. Frames ([`frame`])
//! A frame is an identifier plus every byte after it.
//!
//! ### 2. Schemas and codec ([`schema`], [`codec`])
//! Field layouts per identifier and the single routine that builds frames
//! from named fields and extracts named fields from frames.
//!
//! ### 3. Registry ([`registry`])
//! The built-in message catalog, optionally overridden by an external
//! length table.
//!
//! ### 4. Assembly ([`assembler`])
//! Turns a byte stream into frames, de-obfuscating identifiers as needed.
//!
//! ### 5. Obfuscation ([`cipher`])
//! The legacy rolling-key and three-key identifier ciphers.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use korelink_protocol::{Fields, FrameAssembler, FramingPolicy, Registry};
//!
//! let registry = Arc::new(Registry::builtin());
//! let frame = registry
//!     .build("system_chat", &Fields::new().with("message", "hi"))
//!     .unwrap();
//!
//! let mut assembler = FrameAssembler::new(registry.clone(), FramingPolicy::Disconnect);
//! for frame in assembler.feed(&frame.to_bytes()) {
//!     let frame = frame.unwrap();
//!     let fields = registry.extract(&frame).unwrap();
//!     assert_eq!(fields.text("message").unwrap(), "hi");
//! }
//! ```

pub mod assembler;
pub mod cipher;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message_ids;
pub mod registry;
pub mod schema;

pub use assembler::{FrameAssembler, Frames, FramingPolicy};
pub use cipher::{CipherProfile, MessageCipher, DEFAULT_LEGACY_TRIGGER};
pub use codec::{FieldValue, Fields};
pub use error::FramingError;
pub use frame::Frame;
pub use registry::Registry;
pub use schema::{FieldDescriptor, FieldKind, LengthRule, MessageSchema};
