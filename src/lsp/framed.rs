//! Content-Length framing.
//!
//! Every message on the wire is an HTTP-like header block followed by a body:
//!
//! ```text
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes>
//! ```
//!
//! `FrameDecoder` is a push-based state machine that accepts the stream in
//! arbitrarily small pieces. `FrameReader` and `FrameWriter` drive it over
//! tokio I/O.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::lsp::config::{SessionConfig, DEFAULT_MAX_BODY_LEN, DEFAULT_MAX_HEADER_LEN};
use crate::lsp::error::FramingError;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";
const CONTENT_TYPE: &str = "Content-Type";

/// One complete message body plus the header fields worth keeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    content_type: Option<String>,
    body: Bytes,
}

impl Frame {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Frame {
            content_type: None,
            body: body.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Body length in bytes; this is what `Content-Length` declares.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Header and body, ready to be written.
    pub fn encode(&self) -> Bytes {
        let mut header = format!("{}: {}\r\n", CONTENT_LENGTH, self.body.len());
        if let Some(content_type) = &self.content_type {
            header.push_str(&format!("{}: {}\r\n", CONTENT_TYPE, content_type));
        }
        header.push_str("\r\n");

        let mut out = BytesMut::with_capacity(header.len() + self.body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.body);
        out.freeze()
    }
}

/// Prefix `body` with its Content-Length header.
pub fn encode(body: &[u8]) -> Bytes {
    Frame::new(Bytes::copy_from_slice(body)).encode()
}

#[derive(Debug)]
enum State {
    WaitingForHeader,
    WaitingForBody {
        len: usize,
        content_type: Option<String>,
    },
}

/// Accumulates raw bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    // Bytes of `buffer` already searched for the header terminator.
    scanned: usize,
    max_header_len: usize,
    max_body_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_HEADER_LEN, DEFAULT_MAX_BODY_LEN)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_header_len: usize, max_body_len: usize) -> Self {
        FrameDecoder {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForHeader,
            scanned: 0,
            max_header_len,
            max_body_len,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::with_limits(config.max_header_len, config.max_body_len)
    }

    /// Append bytes without decoding.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Append bytes and return every frame they complete.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, FramingError> {
        self.extend(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.decode()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Extract the next complete frame, or `None` if more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<Frame>, FramingError> {
        loop {
            match &mut self.state {
                State::WaitingForHeader => {
                    let Some(end) = self.find_terminator() else {
                        if self.buffer.len() > self.max_header_len {
                            return Err(FramingError::HeaderTooLarge {
                                max: self.max_header_len,
                            });
                        }
                        return Ok(None);
                    };
                    if end > self.max_header_len {
                        return Err(FramingError::HeaderTooLarge {
                            max: self.max_header_len,
                        });
                    }

                    let header = self.buffer.split_to(end + HEADER_TERMINATOR.len());
                    self.scanned = 0;
                    let (len, content_type) = parse_header(&header[..end], self.max_body_len)?;
                    trace!(len, "parsed frame header");
                    self.state = State::WaitingForBody { len, content_type };
                }
                State::WaitingForBody { len, content_type } => {
                    if self.buffer.len() < *len {
                        return Ok(None);
                    }
                    let len = *len;
                    let content_type = content_type.take();
                    self.state = State::WaitingForHeader;
                    let body = self.buffer.split_to(len).freeze();
                    return Ok(Some(Frame { content_type, body }));
                }
            }
        }
    }

    /// Check that the stream ended on a frame boundary.
    pub fn finish(&self) -> Result<(), FramingError> {
        let mid_frame = matches!(self.state, State::WaitingForBody { .. });
        if mid_frame || !self.buffer.is_empty() {
            return Err(FramingError::UnexpectedEof {
                buffered: self.buffer.len(),
            });
        }
        Ok(())
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn find_terminator(&mut self) -> Option<usize> {
        // Resume a few bytes early so a terminator split across pushes is found.
        let start = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
        let found = self.buffer[start..]
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
            .map(|pos| start + pos);
        if found.is_none() {
            self.scanned = self.buffer.len();
        }
        found
    }
}

fn parse_header(
    header: &[u8],
    max_body_len: usize,
) -> Result<(usize, Option<String>), FramingError> {
    let header = std::str::from_utf8(header)
        .map_err(|_| FramingError::InvalidHeader("header is not valid UTF-8".into()))?;

    let mut content_length: Option<usize> = None;
    let mut content_type = None;

    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(FramingError::InvalidHeader(format!(
                "malformed header line '{}'",
                line
            )));
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
            let len = value
                .bytes()
                .all(|b| b.is_ascii_digit())
                .then(|| value.parse::<usize>().ok())
                .flatten()
                .ok_or_else(|| {
                    FramingError::InvalidHeader(format!("invalid Content-Length '{}'", value))
                })?;
            if content_length.is_some_and(|existing| existing != len) {
                return Err(FramingError::InvalidHeader(
                    "conflicting Content-Length headers".into(),
                ));
            }
            content_length = Some(len);
        } else if name.eq_ignore_ascii_case(CONTENT_TYPE) {
            content_type = Some(value.to_string());
        }
    }

    let len = content_length.ok_or(FramingError::MissingContentLength)?;
    if len > max_body_len {
        return Err(FramingError::BodyTooLarge {
            len,
            max: max_body_len,
        });
    }
    Ok((len, content_type))
}

/// Reads frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::with_config(reader, &SessionConfig::default())
    }

    pub fn with_config(reader: R, config: &SessionConfig) -> Self {
        FrameReader {
            reader,
            decoder: FrameDecoder::from_config(config),
            chunk: vec![0u8; config.read_buffer_size.max(1)],
            eof: false,
        }
    }

    /// Next frame, or `None` once the peer closes the stream between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        loop {
            if let Some(frame) = self.decoder.decode()? {
                return Ok(Some(frame));
            }
            if self.eof {
                self.decoder.finish()?;
                return Ok(None);
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.decoder.extend(&self.chunk[..n]);
            }
        }
    }

    /// The frames as a lazy stream. It ends after clean EOF or the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame, FramingError>> {
        stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// Writes whole frames to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        FrameWriter { writer }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        self.writer.write_all(&frame.encode()).await?;
        self.writer.flush().await
    }

    pub async fn write_body(&mut self, body: &[u8]) -> std::io::Result<()> {
        self.write_frame(&Frame::new(Bytes::copy_from_slice(body)))
            .await
    }

    pub async fn close(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}
