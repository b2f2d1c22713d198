//! Connection Handling
//!
//! Each accepted client is served by its own task. The task owns a
//! [`Connection`] and loops: decode one request, dispatch it to the backend,
//! stream any response back, repeat.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Engine accept loop                          │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept + init_session + enter_connection
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 handle_connection                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Transport   │───>│ Decode msg  │───>│ Dispatch    │      │
//! │  │ (timeouts)  │    │ (bounded)   │    │ to backend  │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │         ▲                                     │             │
//! │         └──────── Start / Entry* / End ───────┘             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The same [`Connection`] type is used on the client side (see
//! [`Engine::start_client`](crate::engine::Engine::start_client)), where it
//! sends requests and reads response frames instead.

mod dispatch;
pub mod handler;
pub mod transport;

// Re-export commonly used types
pub use handler::{handle_connection, Connection, ConnectionError};
pub use transport::Transport;
