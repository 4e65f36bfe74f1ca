//! Domain services used by the websocket relay.
//!
//! ARCHITECTURE
//! ============
//! Service modules own room state and storage concerns so route handlers can
//! stay focused on protocol translation.

pub mod board;
pub mod object;
