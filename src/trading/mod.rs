pub mod account;
pub mod broker;
pub mod ingest;
pub mod model;
pub mod paper;
pub mod pipeline;
pub mod risk;
pub mod router;
pub mod services;
pub mod strategy;
