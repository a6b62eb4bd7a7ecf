//! EagleDeploy - run a playbook of shell commands against many hosts over SSH, concurrently
//!
//! Each task gets its own session (connect, run, disconnect), all tasks run at
//! once, and the run ends with one outcome per task in submission order. One
//! failing host never affects the others.

pub mod cli;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod playbook;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod settings;
