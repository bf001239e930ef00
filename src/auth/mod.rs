//! Authentication state for the admin client.
//!
//! Provides:
//! - [`SessionManager`]: sign-in, sign-out, session restore and reaction to
//!   backend session-change events
//! - [`SessionStore`]: backend tokens, optionally persisted to a file so a
//!   session survives restarts
//!
//! ## Design Decisions
//! - The backend owns authority over credentials and email semantics; the
//!   client only guards that an email contains `@`.
//! - A session whose profile cannot be loaded stays authenticated with no
//!   role, so profile-store latency never blocks sign-in.

pub mod manager;
pub mod store;

pub use manager::{AuthPhase, SessionManager, SessionState};
pub use store::{AuthSession, Identity, SessionStore};
