//! Wire protocol
//!
//! Every unit on the wire is a frame: a big-endian u32 length followed by an
//! envelope (`Message`). The envelope carries an independently encoded head
//! whose schema depends on the envelope type, and an opaque body.
//!
//! | type | head             | body                         |
//! |------|------------------|------------------------------|
//! | 0    | `RequestHeader`  | `ServerMetadata`             |
//! | 1    | `ResponseHeader` | operation specific           |
//! | 2    | `ChatHeader`     | chat payload, never decoded  |

pub use header::{ChatHeader, RequestHeader, ResponseHeader, SERVER_ADDRESS};
pub use message::{Message, MessageType, LENGTH_FIELD_SIZE};
pub use metadata::{BriefUser, Operation, ServerMetadata, StatusCode, UserList, UserState};
pub use primary_types::WireFormat;

mod header;
mod message;
mod metadata;
mod primary_types;
