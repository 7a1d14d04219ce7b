//! Command Handler Module
//!
//! The layer between decoded datagrams and the cache.
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ DatagramCodec   │  (protocol module)
//! └────────┬────────┘
//!          │ Request
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │  - Validate     │
//! │  - Execute      │
//! │  - Map errors   │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Cache       │  (cache module)
//! └─────────────────┘
//! ```

pub mod handler;

pub use handler::CommandHandler;
