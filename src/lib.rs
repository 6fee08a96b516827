#[macro_use]
extern crate log;

#[macro_use]
extern crate serde;

pub mod api;
pub mod common;
pub mod coordinator;
pub mod metric_store;
pub mod settings;
pub mod store;
