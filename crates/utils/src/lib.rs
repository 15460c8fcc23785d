pub mod assets;
pub mod build_info;
pub mod config;
pub mod log_sink;
pub mod path;
