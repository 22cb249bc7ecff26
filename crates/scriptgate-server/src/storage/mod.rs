//! SQLite storage for the Scriptgate server.
//!
//! Provides persistence for applications, devices, secure scripts, script
//! deliveries, real-time instructions and the device connection audit trail.

mod db;
mod models;
mod queries;
mod queries_instructions;
mod queries_scripts;


pub use db::{DatabaseError, ServerDatabase};
pub use models::*;
pub use queries_instructions::NewInstruction;
pub use queries_scripts::{DeliveryTransition, NewDelivery, NewScript, PolicyUpdate};
