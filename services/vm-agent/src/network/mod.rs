//! Host network devices for microVMs.
//!
//! Each VM gets a dedicated TAP device for its eth0 interface. Device
//! operations go through the [`TapDriver`] trait so that hosts without
//! `CAP_NET_ADMIN` (and tests) can run against [`MockTapDriver`].

mod tap;

pub use tap::{IpTapDriver, MockTapDriver, TapCall, TapDriver, TapError};
