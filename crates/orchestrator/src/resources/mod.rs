//! RAII guards that keep a session's side effects consistent even when its
//! runner unwinds.
//!
//! - [`SessionGuard`] - terminal event for every session
//! - [`WorkingCopy`] - per-session directory removed on release or drop

mod session_guard;
mod working_copy;

pub use session_guard::SessionGuard;
pub use working_copy::WorkingCopy;
