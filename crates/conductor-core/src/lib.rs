pub mod config;
pub mod execution;
pub mod frontends;
pub mod logs;
pub mod models;
pub mod notifications;
pub mod orchestration;
pub mod persistence;
pub mod schedule;
pub mod sqlite;
