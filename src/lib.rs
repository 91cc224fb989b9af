pub mod application;
pub mod cache;
pub mod config;
pub mod demo;
pub mod infra;
