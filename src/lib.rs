//! MultiDown: 多连接、可断点续传的 HTTP 下载引擎

pub mod cli;
pub mod config;
pub mod core;
pub mod ui;
pub mod utils;
