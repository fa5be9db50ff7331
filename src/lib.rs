pub mod collab;
pub mod config;
pub mod consensus;
pub mod fusion;
pub mod logging;
pub mod market;
pub mod pipeline;
pub mod position;
pub mod retry;
pub mod safety;
pub mod schedule;
pub mod slots;
pub mod storage;
pub mod traps;
