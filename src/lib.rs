pub mod bridge;
pub mod cli;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod info_server;
pub mod launcher_log;
pub mod network;
pub mod pattern;
pub mod publisher;
pub mod runtime_state;
pub mod supervisor;
pub mod tunnel;
pub mod verify;
