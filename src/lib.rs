pub mod cli;
pub mod config;
pub mod history;
pub mod platform;
pub mod report;
pub mod retention;
pub mod run;
pub mod store;
