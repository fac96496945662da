pub mod control;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod sink;
pub mod stream;

pub use dispatch::Delivery;
pub use error::{ApiError, RegistryError, SinkError};
pub use notify::Notifier;
pub use registry::{Connection, ConnectionInfo, ConnectionRegistry};
pub use scheduler::{SchedulerConfig, SchedulerHandle};
pub use server::{start, AppState, ServerConfig, ServerHandle};
pub use session::{SessionIdentity, SessionLookup, StaticSessions};
pub use sink::{ChannelSink, EventSink};
