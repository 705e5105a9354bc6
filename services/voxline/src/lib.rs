pub mod adapters;
pub mod api;
pub mod call_store;
pub mod config;
pub mod factory;
pub mod functions;
pub mod pipeline;
pub mod prompt_loader;
pub mod stream_service;

#[cfg(test)]
mod testing;
