pub mod cmdline;
pub mod config;
pub mod container;
pub mod job;
pub mod logging;
pub mod run;
pub mod schema;
pub mod submit;

pub type Result<T> = anyhow::Result<T>;
