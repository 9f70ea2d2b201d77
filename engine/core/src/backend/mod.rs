//! Backend Capabilities
//!
//! Uniform abstraction over every callable backend. The engine only sees
//! [`AnswerBackend`] and [`SourceBackend`] trait objects; concrete
//! implementations live in submodules.
//!
//! - [`traits`]: capability traits, request/response types, chain descriptors
//! - [`local`]: rule-based terminal fallback
//! - [`http`]: JSON-over-HTTP implementations

pub mod http;
pub mod local;
pub mod traits;

pub use http::{HttpAnswerBackend, HttpSourceBackend};
pub use local::{LocalResponder, LOCAL_BACKEND_ID};
pub use traits::{
    Answer, AnswerBackend, AnswerRequest, BackendDescriptor, FetchRequest, SourceBackend,
};
