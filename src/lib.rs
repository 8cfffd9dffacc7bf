pub mod api;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod outcome;
pub mod poll;
pub mod report;
pub mod samples;
pub mod submit;
pub mod subject;
pub mod sweep;
pub mod util;
