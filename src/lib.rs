//! eve-notify - desktop notifications from EVE Online character logs

mod entity;
mod rules;

pub use entity::*;
pub use rules::*;

pub mod config;
pub mod discovery;
pub mod error;
pub mod monitor;
pub mod notification;
pub mod registry;
pub mod supervisor;
pub mod tail;

pub use error::{Error, Result};
