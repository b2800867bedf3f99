pub mod agent;
pub mod analyzer;
pub mod audit;
pub mod config;
pub mod fixer;
pub mod git;
pub mod github;
pub mod notify;
pub mod pipeline;
pub mod platform;
pub mod policy;
pub mod retry;
pub mod submitter;
pub mod types;
pub mod workspace;

pub use types::*;
