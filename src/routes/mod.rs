//! HTTP route handlers.
//!
//! Each sub-module corresponds to one endpoint group. The websocket endpoint
//! lives in [`crate::ws`].

pub mod assets;
pub mod health;
pub mod index;
pub mod upload;
