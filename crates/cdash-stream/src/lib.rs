pub mod actions;
pub mod config;
pub mod error;
pub mod multiplexer;
pub mod session;
pub mod transport;

pub use actions::{navigation_from_response, Navigation, RetryAction};
pub use config::{parse_bool_flag, StreamConfig, DEFAULT_BASE_URL};
pub use error::{ActionError, TransportError};
pub use multiplexer::{ConnectionState, Diagnostic, Handler, StreamHandle, StreamRegistry};
pub use session::{
    DetailsSession, LogSourceInfo, Notification, NotificationLevel, ResourceKind,
    SessionBootstrap, TestStatus, ViewChange,
};
pub use transport::{cache_busted, HttpTransport, MemoryTransport, OpenRecord, Transport};
