pub mod adapter;
pub mod cli;
pub mod config;
pub mod poller;
pub mod push;
pub mod retry;
pub mod sample;
pub mod service;
pub mod sink;
pub mod tplink;
pub mod validate;
