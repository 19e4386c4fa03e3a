pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod knowledge;
pub mod lifecycle;
pub mod model;
pub mod publish;
pub mod reconcile;
pub mod scheduler;
pub mod scrub;
pub mod services;
pub mod source;
pub mod storage;
