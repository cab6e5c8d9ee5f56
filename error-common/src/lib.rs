//! Common error handling for Stagemark's network layer
//!
//! Every outbound call made by the client ends in either a parsed body or a
//! [`RequestError`]. This crate owns that taxonomy so the transport, the
//! retry layer and the sync queue agree on what is worth retrying.
//!
//! # Error Categories
//!
//! - **Network**: the request never reached the server (retryable)
//! - **Server**: 5xx, 429 and 408 responses (retryable)
//! - **Client**: any other 4xx response (not retryable)
//! - **Timeout**: the local advisory timeout fired (retryable)
//! - **Cancelled**: the caller aborted the request (not retryable)
//! - **Decode**: the response body could not be parsed (not retryable)
//!
//! # Example
//!
//! ```rust
//! use error_common::{RequestError, user_message};
//!
//! let err = RequestError::from_status(503, "upstream unavailable");
//! assert!(err.is_retryable());
//!
//! let err = RequestError::from_status(404, "no such session");
//! assert!(!err.is_retryable());
//! assert!(!user_message(&err).contains("no such session"));
//! ```

pub mod codes;
pub mod sanitization;
pub mod types;

pub use codes::*;
pub use sanitization::*;
pub use types::*;
