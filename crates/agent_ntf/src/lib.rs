//! agent_ntf — Notification Supervisor (C4): token lifecycle plus a
//! per-connection subscription mirror driven off an inbound command queue.

pub mod error;
pub mod supervisor;
pub mod token;

pub use error::NtfError;
pub use supervisor::{NoopNtfRelay, NtfCommand, NtfRelay, NtfSupervisor};
pub use token::{NtfMode, NtfToken, NtfTokenState, NtfTransition};
