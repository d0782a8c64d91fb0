//! Core logic: app tree, parsing, building, resolution, synthesis, planning, deploy.

pub mod app;
pub mod builder;
pub mod deployer;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod synth;
pub mod types;
