//! Request/response model and the network seam the worker fetches through.

mod client;
#[cfg(test)]
pub mod mock;
mod types;

pub use client::{HttpNetwork, Network};
pub use types::{Destination, FetchError, Request, Response, CLIENT_ID_HEADER};
