pub mod action;
pub mod config;
pub mod engine;
pub mod key;
pub mod log;
pub mod model;
pub mod net;
pub mod node;
pub mod op;
pub mod store;
pub mod task;
pub mod transfer;
pub mod view;

pub use anyhow::{anyhow as err, bail, Error, Result};

pub use crate::model::Addr;
