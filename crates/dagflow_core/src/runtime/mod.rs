//! Interfaces to the collaborators execution depends on, with in-memory
//! implementations.

pub mod emitter;
pub mod exchange;
pub mod filesystem;
pub mod store;
