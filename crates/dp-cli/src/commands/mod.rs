pub mod clear;
pub mod config;
pub mod decode;
pub mod history;
pub mod info;
pub mod list;
pub mod sweep;
