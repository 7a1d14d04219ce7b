//! Connection Handler Module
//!
//! Each accepted client is served by its own Tokio task.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener (main.rs)                  │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept() + spawn
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌────────────┐   ┌──────────────┐   ┌─────────────────┐    │
//! │  │ Read bytes │──>│ Decode JSON  │──>│ CommandHandler  │    │
//! │  └────────────┘   └──────────────┘   └────────┬────────┘    │
//! │                                               ▼             │
//! │                                      ┌─────────────────┐    │
//! │                                      │  Write reply    │    │
//! │                                      └─────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
