#![deny(missing_docs)]
//! Derpi courier library.
//!
//! Serves image board pictures to chat channels with per-channel rate
//! discipline, hold-on notices and "another one" follow-ups.

/// Image board access and rating filters.
pub mod booru;
/// Telegram transport.
pub mod bot;
/// Configuration management.
pub mod config;
/// Per-channel request coordination.
pub mod coordination;
/// Image service facade used by transports.
pub mod service;
/// Utility functions.
pub mod utils;
