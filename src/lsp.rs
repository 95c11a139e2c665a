pub mod config;
pub mod error;
pub mod framed;
pub mod handler;
pub mod lifecycle;
pub mod message_creator;
pub mod message_parser;
pub mod pending;
pub mod registry;
pub mod session;
pub mod stdio_transport;
pub mod types;

pub use config::SessionConfig;
pub use error::{Error, FramingError};
pub use framed::{Frame, FrameDecoder, FrameReader, FrameWriter};
pub use handler::{NotificationHandler, RequestHandler, Router};
pub use lifecycle::{Direction, Lifecycle, PhaseViolation, SessionPhase, Traffic, ViolationKind};
pub use pending::{CorrelationTable, PendingHandle};
pub use registry::{
    LspNotification, LspRequest, MethodRegistry, MethodSpec, NotificationMethod, RequestMethod,
};
pub use session::{Session, SessionBuilder};
pub use stdio_transport::StdioServer;
pub use types::{ErrorCode, Message, Notification, Request, RequestId, Response, ResponseError};

pub type Result<T, E = Error> = std::result::Result<T, E>;
