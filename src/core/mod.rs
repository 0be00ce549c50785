//! OS-facing plumbing for a session.
//!
//! - **termmode**: raw/cooked switching of the controlling terminal
//! - **channel**: pipes between stages and the frame codec they share
//! - **session**: channel setup, stage spawn and teardown
//!
//! # Architecture
//!
//! ```text
//! session owner (input stage)
//! ├── echo channel ──────────────────────────┐
//! └── line channel ──> translation stage     │
//!                      └── translated channel ┴──> output stage ──> display
//! ```

pub mod channel;
pub mod session;
pub mod termmode;
