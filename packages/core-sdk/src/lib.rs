pub mod db;
pub mod llm;
pub mod models;
pub mod server;
pub mod telemetry;
