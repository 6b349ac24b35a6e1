//! Request handling behind the network core.
//!
//! The `Router` classifies every ingested frame: chat frames are forwarded
//! to the recipient's connection untouched, request frames are handed to
//! the `RequestProcessor`, which answers each one through a `Responder`.

pub use request_processor::{Reply, RequestProcessor};
pub use router::{MetadataRequest, Responder, RouteOutcome, Router};

mod request_processor;
mod router;
