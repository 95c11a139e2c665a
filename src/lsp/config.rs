/// Default limit for a header block (`Content-Length` plus optional fields).
pub const DEFAULT_MAX_HEADER_LEN: usize = 8 * 1024;

/// Default limit for a single message body.
pub const DEFAULT_MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Default size of each read from the transport.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Tunables for a session and its framer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name attached to the session's tracing span.
    pub name: String,
    /// Largest accepted header block, in bytes.
    pub max_header_len: usize,
    /// Largest accepted body, in bytes.
    pub max_body_len: usize,
    /// Bytes requested from the transport per read.
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            name: String::from("lsp"),
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            max_body_len: DEFAULT_MAX_BODY_LEN,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_body_len(mut self, max: usize) -> Self {
        self.max_body_len = max;
        self
    }

    pub fn with_max_header_len(mut self, max: usize) -> Self {
        self.max_header_len = max;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}
