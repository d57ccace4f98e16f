//! weft-core — shared leaf subsystems of the weft fabric.
//!
//! Everything below the transport lives here: subjects and the subject
//! trie, the control-frame contract, the actor claims expression
//! language, fragmentation/reassembly, HTTP carrier utilities,
//! environment configuration, and the traced error type. All other
//! weft crates depend on this one.

pub mod boolexpr;
pub mod config;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod httpx;
pub mod subject;
pub mod trie;

pub use config::{Deployment, FabricConfig};
pub use error::{Error, Result};
pub use frame::{Frame, FrameMut, OpCode};
pub use httpx::{Body, Carrier};
