pub mod args;
pub mod commands;
pub mod server;
pub mod services;
