//! Unit test suite.
//!
//! Store- and database-backed behavior is covered by the integration
//! tests under `tests/` (some of which require a running redis and are
//! marked `#[ignore]`); everything here runs self-contained.

mod error;
mod palette;
mod ratelimit;
mod sms;
