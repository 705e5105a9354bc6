mod client;
pub mod types;

pub use client::{
    AssistantsApi, ChatApi, ChunkRx, Client, Config, ConfigBuilder, Error, RunRx, Stats,
};
