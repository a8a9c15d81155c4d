pub mod db;
pub mod email;
pub mod env;
pub mod log;
pub mod redis;
