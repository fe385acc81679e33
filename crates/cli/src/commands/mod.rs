//! CLI command implementations

pub mod demo;
pub mod emit;
pub mod run;

pub use demo::DemoCommand;
pub use emit::{BanCommand, BlockCommand, SendCommand};
pub use run::RunCommand;
