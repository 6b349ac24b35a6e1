pub use presence::{PresenceIndex, PresenceStore};
pub use user::UserDirectory;

mod presence;
mod user;
