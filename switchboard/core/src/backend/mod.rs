//! Backend Abstraction
//!
//! The contract every LLM backend implements, the constructor registry that
//! turns configuration into handles, and an in-process mock.

pub mod factory;
pub mod mock;
pub mod traits;

pub use factory::{BackendConstructor, BackendFactory};
pub use mock::MockBackend;
pub use traits::*;
