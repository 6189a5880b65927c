//! File-transfer framing over a text/binary WebSocket stream.
//!
//! Wire format:
//!
//! ```text
//! text   "#file|<name>|<size>"     announces a transfer of <size> bytes
//! binary <chunk> ...               body, until exactly <size> bytes arrived
//! text   anything else             an ordinary chat message
//! ```
//!
//! Chunk boundaries carry no meaning: one binary unit may hold the whole body.

use bytes::{Bytes, BytesMut};

/// First field of a file header text unit.
pub const FILE_HEADER_PREFIX: &str = "#file";

const FIELD_SEPARATOR: char = '|';

/// Text units starting with this are header attempts; anything else is chat.
const HEADER_MARKER: &str = "#file|";

/// Upper bound for the initial body buffer; larger bodies grow as chunks arrive.
const INITIAL_BODY_CAPACITY: usize = 1024 * 1024;

/// One inbound transport unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Announced file: name plus the exact number of body bytes to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub file_name: String,
    pub declared_size: u64,
    /// The header unit as received, relayed byte for byte.
    wire: String,
}

impl FileHeader {
    pub fn new(file_name: impl Into<String>, declared_size: u64) -> Self {
        let file_name = file_name.into();
        let wire = format!(
            "{FILE_HEADER_PREFIX}{FIELD_SEPARATOR}{file_name}{FIELD_SEPARATOR}{declared_size}"
        );
        Self {
            file_name,
            declared_size,
            wire,
        }
    }

    /// Parse a `#file|<name>|<size>` header unit.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let malformed = |reason: &'static str| ProtocolError::MalformedHeader {
            header: text.to_string(),
            reason,
        };

        let fields: Vec<&str> = text.split(FIELD_SEPARATOR).collect();
        let [prefix, file_name, size] = fields.as_slice() else {
            return Err(malformed("expected exactly three `|`-separated fields"));
        };
        if *prefix != FILE_HEADER_PREFIX {
            return Err(malformed("unknown header prefix"));
        }
        if file_name.is_empty() {
            return Err(malformed("empty file name"));
        }
        // u64::from_str accepts a leading '+', the wire format does not
        if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed("size is not a non-negative integer"));
        }
        let declared_size = size
            .parse::<u64>()
            .map_err(|_| malformed("size does not fit in 64 bits"))?;

        Ok(Self {
            file_name: (*file_name).to_string(),
            declared_size,
            wire: text.to_string(),
        })
    }

    /// The header unit exactly as it travels on the wire.
    pub fn to_wire(&self) -> &str {
        &self.wire
    }
}

/// A classified inbound unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text { payload: String },
    FileHeader(FileHeader),
    FileChunk { bytes: Bytes },
}

impl Message {
    /// Classify a frame without regard to transfer state.
    pub fn classify(frame: Frame) -> Result<Self, ProtocolError> {
        match frame {
            Frame::Text(text) if text.starts_with(HEADER_MARKER) => {
                FileHeader::parse(&text).map(Message::FileHeader)
            }
            Frame::Text(payload) => Ok(Message::Text { payload }),
            Frame::Binary(bytes) => Ok(Message::FileChunk { bytes }),
        }
    }
}

/// A fully received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub file_name: String,
    pub body: Bytes,
    header: String,
}

impl FileTransfer {
    /// A file with a freshly rendered header.
    pub fn new(file_name: impl Into<String>, body: Bytes) -> Self {
        let header = FileHeader::new(file_name, body.len() as u64);
        Self::with_header(header, body)
    }

    fn with_header(header: FileHeader, body: Bytes) -> Self {
        Self {
            file_name: header.file_name,
            body,
            header: header.wire,
        }
    }

    /// The header unit to send ahead of the body.
    pub fn header_text(&self) -> &str {
        &self.header
    }
}

/// A complete logical message yielded by [`FrameProtocol::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    Text(String),
    File(FileTransfer),
}

/// Connection-local framing violation. The connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed file header {header:?}: {reason}")]
    MalformedHeader { header: String, reason: &'static str },

    #[error("file {file_name:?} declares {declared_size} bytes, limit is {limit}")]
    FileTooLarge {
        file_name: String,
        declared_size: u64,
        limit: u64,
    },

    #[error("file {file_name:?} overran its declared size: {received} of {declared_size} bytes")]
    Oversized {
        file_name: String,
        declared_size: u64,
        received: u64,
    },

    #[error("text unit received mid-transfer of {file_name:?}")]
    TextDuringTransfer { file_name: String },

    #[error("binary unit of {len} bytes received outside a file transfer")]
    UnexpectedBinary { len: usize },
}

/// The connection went away before the announced body was complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transfer of {file_name:?} interrupted after {received} of {declared_size} bytes")]
pub struct TransferInterrupted {
    pub file_name: String,
    pub declared_size: u64,
    pub received: u64,
}

#[derive(Debug)]
enum State {
    AwaitHeader,
    ReceivingBody { header: FileHeader, body: BytesMut },
}

/// Per-connection framing state machine.
#[derive(Debug)]
pub struct FrameProtocol {
    state: State,
    max_file_bytes: Option<u64>,
}

impl FrameProtocol {
    /// `max_file_bytes` rejects headers announcing more than that many bytes.
    pub fn new(max_file_bytes: Option<u64>) -> Self {
        Self {
            state: State::AwaitHeader,
            max_file_bytes,
        }
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.state, State::ReceivingBody { .. })
    }

    /// Feed one inbound frame.
    ///
    /// Returns `Ok(None)` while a body is still accumulating. Every error
    /// leaves the machine back in the await-header state with any partial
    /// body discarded.
    pub fn feed(&mut self, frame: Frame) -> Result<Option<Assembled>, ProtocolError> {
        match std::mem::replace(&mut self.state, State::AwaitHeader) {
            State::AwaitHeader => self.await_header(frame),
            State::ReceivingBody { header, body } => self.receive_body(header, body, frame),
        }
    }

    /// Consume the end of the stream, reporting an abandoned transfer if any.
    pub fn finish(&mut self) -> Option<TransferInterrupted> {
        match std::mem::replace(&mut self.state, State::AwaitHeader) {
            State::AwaitHeader => None,
            State::ReceivingBody { header, body } => Some(TransferInterrupted {
                file_name: header.file_name,
                declared_size: header.declared_size,
                received: body.len() as u64,
            }),
        }
    }

    fn await_header(&mut self, frame: Frame) -> Result<Option<Assembled>, ProtocolError> {
        match Message::classify(frame)? {
            Message::Text { payload } => Ok(Some(Assembled::Text(payload))),
            Message::FileHeader(header) => self.begin_transfer(header),
            Message::FileChunk { bytes } => Err(ProtocolError::UnexpectedBinary { len: bytes.len() }),
        }
    }

    fn begin_transfer(&mut self, header: FileHeader) -> Result<Option<Assembled>, ProtocolError> {
        if let Some(limit) = self.max_file_bytes {
            if header.declared_size > limit {
                return Err(ProtocolError::FileTooLarge {
                    file_name: header.file_name,
                    declared_size: header.declared_size,
                    limit,
                });
            }
        }

        if header.declared_size == 0 {
            return Ok(Some(Assembled::File(FileTransfer::with_header(
                header,
                Bytes::new(),
            ))));
        }

        let capacity = usize::try_from(header.declared_size)
            .unwrap_or(usize::MAX)
            .min(INITIAL_BODY_CAPACITY);
        self.state = State::ReceivingBody {
            header,
            body: BytesMut::with_capacity(capacity),
        };
        Ok(None)
    }

    fn receive_body(
        &mut self,
        header: FileHeader,
        mut body: BytesMut,
        frame: Frame,
    ) -> Result<Option<Assembled>, ProtocolError> {
        let chunk = match frame {
            Frame::Binary(chunk) => chunk,
            Frame::Text(_) => {
                return Err(ProtocolError::TextDuringTransfer {
                    file_name: header.file_name,
                });
            }
        };

        let received = body.len() as u64 + chunk.len() as u64;
        if received > header.declared_size {
            return Err(ProtocolError::Oversized {
                file_name: header.file_name,
                declared_size: header.declared_size,
                received,
            });
        }

        body.extend_from_slice(&chunk);
        if received == header.declared_size {
            return Ok(Some(Assembled::File(FileTransfer::with_header(
                header,
                body.freeze(),
            ))));
        }

        self.state = State::ReceivingBody { header, body };
        Ok(None)
    }
}

impl Default for FrameProtocol {
    fn default() -> Self {
        Self::new(None)
    }
}
