//! Client-side core of a message-board admin backed by Supabase.
//!
//! - [`auth::SessionManager`] tracks who is signed in and with which role
//! - [`feed::MessageSynchronizer`] keeps the message feed and the profile
//!   directory in step with the backend's change feed
//! - [`integrations`] holds the backend contract and its implementations
//! - [`app::AdminApp`] wires them together for one backend

pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod feed;
pub mod integrations;

pub use app::AdminApp;
pub use auth::{AuthPhase, SessionManager, SessionState};
pub use config::Config;
pub use error::{Result, SyncError};
pub use feed::{Message, MessageSynchronizer, Profile, Role};
