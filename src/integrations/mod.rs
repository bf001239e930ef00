//! Backend access layer.
//!
//! - [`Backend`]: the contract the session manager and synchronizer use
//! - [`SupabaseBackend`]: GoTrue + PostgREST over HTTP, Realtime over WebSocket
//! - [`MemoryBackend`]: in-process tables and change feed

pub mod memory;
pub mod realtime;
pub mod supabase;
pub mod traits;

pub use memory::MemoryBackend;
pub use supabase::SupabaseBackend;
pub use traits::{
    AuthEvent, AuthEventKind, Backend, ChangeEvent, ChangeFilter, ChangeKind, ChangeSubscription,
};
