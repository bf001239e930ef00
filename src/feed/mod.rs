//! The message feed and profile directory.
//!
//! - [`model`]: rows as the backend returns them
//! - [`MessageSynchronizer`]: cached feed kept in step with the backend

pub mod model;
pub mod synchronizer;

pub use model::{
    parse_timestamp, sort_feed, Message, MessagePatch, NewMessage, Profile, ProfilePatch, Role,
    MESSAGES_TABLE, MESSAGE_SELECT, PROFILES_TABLE,
};
pub use synchronizer::{validate_avatar_url, MessageSynchronizer};
