pub mod decoder;
pub mod events;
pub mod frame;
pub mod ids;
pub mod presence;

pub use decoder::{Decoded, StreamDecoder, StreamEvent};
pub use events::{BoardEvent, Outbound};
pub use frame::{Frame, HEARTBEAT};
pub use ids::{BoardId, ConnectionId, UserId};
pub use presence::{PresenceEntry, PresenceError, PresenceStore};
