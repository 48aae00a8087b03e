//! Command modules for the BPDB CLI

pub mod run;

pub use run::ScenarioRunner;
