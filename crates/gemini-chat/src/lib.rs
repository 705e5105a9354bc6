mod client;
pub mod types;

pub use client::{DEFAULT_MODEL, Error, GeminiClient, GenerateApi, ResponseRx};
