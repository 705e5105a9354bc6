pub mod audio;
pub mod sse;
