// Library exports for the Vigil process supervisor

pub mod config;
pub mod cron;
pub mod daemon;
pub mod error;
pub mod logs;
pub mod monitor;
pub mod process;
