//! ember-ai: provider-neutral chat types and the model backend capability
//!
//! Nothing in this crate speaks a vendor wire format. Backends plug in through
//! [`ChatProvider`]; the bundled [`CommandProvider`] hands each request to an
//! external program as JSON.

pub mod bridge;
pub mod error;
pub mod models;
pub mod provider;
pub mod types;

pub use bridge::CommandProvider;
pub use error::{Error, Result};
pub use models::ModelInfo;
pub use provider::{ChatProvider, ChatRequest, is_capacity_message};
pub use types::*;
