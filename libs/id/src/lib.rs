//! # stevedore-id
//!
//! Typed handles for the objects a CI worker realizes.
//!
//! Handles are system-generated and never reused. A container handle is
//! allocated once, when the first `Creating` record for a container identity
//! is persisted, and from then on names that container on the worker's
//! runtime, in the volume service, and in the database.
//!
//! ## Handle Format
//!
//! Handles use a prefixed format: `{prefix}_{ulid}`
//!
//! - `ctr_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `vol_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! Teams are identified by plain integers, see [`TeamId`].

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
