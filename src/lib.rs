#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]

pub mod api;
pub mod app_config;
pub mod error;
pub mod job;
pub mod time_util;
pub mod trading;
