use once_cell::sync::Lazy;
use std::env;

pub mod codec;
pub mod data;
pub mod error;
pub mod limits;

pub static APP_NAME: &str = "agentrun";
pub static APP_WORKER_NAME: &str = "agentrun-worker";
pub static APP_FRONT_NAME: &str = "agentrun-front";

pub static HTTP_ADDR: Lazy<String> =
    Lazy::new(|| env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:9010".to_string()));
