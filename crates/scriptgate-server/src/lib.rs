//! Scriptgate Server Library
//!
//! Core functionality for the Scriptgate server:
//! - SQLite storage for applications, devices, scripts, deliveries and
//!   instructions
//! - Entitlement gate and device-bound delivery packaging
//! - Delivery and instruction lifecycle tracking
//! - WebSocket command hub with signed real-time instructions
//! - axum HTTP surface for clients and operators

pub mod api;
pub mod apps;
pub mod delivery;
pub mod error;
pub mod gate;
pub mod hub;
pub mod lifecycle;
pub mod scripts;
pub mod storage;
