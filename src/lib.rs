pub mod auditor;
pub mod cli;
pub mod config;
pub mod decoder;
pub mod input;
pub mod message;
pub mod pipeline;
pub mod processor;
pub mod sender;
