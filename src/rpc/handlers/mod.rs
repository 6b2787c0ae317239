//! RPC method handlers. Param shapes are validated explicitly per method;
//! handlers return `anyhow::Result<Value>` and rely on the dispatch
//! boundary to translate failures into wire errors.

pub mod auth;
pub mod message;
pub mod tasks;
