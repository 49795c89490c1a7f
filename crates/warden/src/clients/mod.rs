//! Thin typed clients for the metrics and log backends.

pub mod loki;
pub mod prometheus;

pub use loki::LokiClient;
pub use prometheus::PrometheusClient;
