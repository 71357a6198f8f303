pub mod app;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod event;
pub mod interceptor;
pub mod monitor;
pub mod net;
pub mod queue;
pub mod replay;
pub mod worker;
