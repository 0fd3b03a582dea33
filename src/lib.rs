pub mod calendar;
pub mod config;
pub mod engine;
pub mod journal;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
