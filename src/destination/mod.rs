// ABOUTME: Destination module - Elasticsearch-compatible search backend
// ABOUTME: Exposes the HTTP client and the structured watermark request builder

pub mod client;
pub mod request;

pub use client::{ClientOptions, ElasticsearchClient};
pub use request::TopWatermarkQuery;
