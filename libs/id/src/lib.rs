//! # ember-id
//!
//! Typed identifiers for the ember microVM agent.
//!
//! Every VM gets an opaque, globally unique identifier at create time. The
//! identifier is immutable for the lifetime of the VM and doubles as the
//! file stem for its control socket and configuration artifact. The string
//! form is the lowercase `vm_` prefix followed by the ULID in uppercase
//! Crockford base32 (`[0-9A-HJKMNP-TV-Z]`), so it needs no escaping in file
//! names or URLs.
//!
//! ## ID Format
//!
//! IDs use the format `vm_{ulid}`, for example
//! `vm_01HV4Z4NYPLTRS0JTUA8XDME5F`.
//!
//! - the prefix makes an ID recognisable in logs and paths
//! - the ULID is time-ordered, so listings sort by creation time
//! - parsing is strict: wrong prefix, missing separator and malformed ULIDs
//!   are all rejected

mod error;
mod types;

pub use error::IdError;
pub use types::VmId;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
