pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
