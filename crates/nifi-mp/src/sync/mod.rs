//! Wake-up primitives for the shared-memory transport.

pub mod semaphore;

pub use semaphore::{Semaphore, SemaphorePool};
