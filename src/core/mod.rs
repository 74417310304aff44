//! Core template logic: config types and parsing, the intrinsic value
//! model, resource sets, output collection, planning and local state.

pub mod cidr;
pub mod intrinsic;
pub mod outputs;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod template;
pub mod types;
