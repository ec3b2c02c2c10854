//! In-place ELF executable compression.
//!
//! `sqz` rewrites an ELF executable or shared library into a smaller file
//! that still loads and runs: the load image is compressed into a block
//! stream, a small architecture-specific stub is embedded to expand it at
//! startup, and enough metadata is recorded that `unpack` reproduces the
//! original file byte for byte.
//!
//! The public surface is [`pack`], [`unpack`] and [`can_pack`]; everything
//! else is exposed for the command-line front end and the tests.

pub mod arch;
pub mod compress;
pub mod elf;
pub mod endian;
pub mod error;
pub mod filter;
pub mod layout;
pub mod pack;
pub mod plan;
pub mod select;
pub mod stub;
pub mod trailer;
pub mod unpack;

pub use error::{Error, Result};
pub use pack::{can_pack, pack, PackOptions};
pub use unpack::{unpack, UnpackOutcome, Unpacked};
