//! Session supervision above the dispatch broker
//!
//! A session owns one [`MuxDispatcher`](crate::dispatch::MuxDispatcher),
//! drives a set of cases through it in the background, and exposes the
//! pull/submit surface external workers use. It enforces the capacity gate
//! and aborts sessions that go quiet for longer than their TTL.

pub mod error;
pub mod registry;
pub mod signal_bus;
pub mod supervisor;

pub use error::{SessionError, SessionResult};
pub use registry::SessionRegistry;
pub use signal_bus::{Signal, SignalBus, SharedSignalBus};
pub use supervisor::{
    strip_code_fences, NextStep, Session, SessionConfig, SessionReport, SessionStatus,
};
