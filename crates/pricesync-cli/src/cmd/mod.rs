pub mod config;
pub mod lines;
pub mod locks;
pub mod serve;
pub mod sync;
