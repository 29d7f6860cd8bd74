//! Streaming `multipart/form-data` decoder.
//!
//! The request body is consumed one byte at a time and never buffered as a
//! whole. Part bodies are pushed through a [`RotatingWindow`] sized to the
//! delimiter `"\r\n--" + boundary`: a byte is written to the destination blob
//! only once it has been evicted from the window, so when the window matches
//! the delimiter none of its bytes have reached the blob.
//!
//! ```text
//! AwaitFirstBoundary ──▶ PartHeaders ──▶ PartBody ──┬──▶ Done ("--")
//!                             ▲                     │
//!                             └──────── "" ─────────┘
//! ```

use crate::header::{Header, HeaderError};
use crate::line_reader::{read_byte, read_line, LineError, DEFAULT_MAX_LINE_LEN};
use crate::rotating_window::RotatingWindow;
use crate::store::{Store, StoreError, TEMP_PREFIX};
use std::fmt;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use tracing::{debug, info, instrument, warn};

/// Name used for parts that carry no `filename` parameter.
pub const PLACEHOLDER_NAME: &str = "unknown";

const MULTIPART_FORM_DATA: &str = "multipart/form-data";
const DEFAULT_MAX_PARTS: usize = 64;

/// Limits and defaults applied while decoding.
#[derive(Debug, Clone)]
pub struct DecoderSettings {
    /// Longest accepted boundary or header line
    pub max_line_len: usize,
    /// Maximum number of parts in one request
    pub max_parts: usize,
    /// Blob name for parts without a file name
    pub placeholder_name: String,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_parts: DEFAULT_MAX_PARTS,
            placeholder_name: PLACEHOLDER_NAME.to_string(),
        }
    }
}

/// What went wrong at the protocol level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    NotMultipart,
    MissingBoundary,
    MissingLineTerminator,
    LineTooLong,
    BoundaryMismatch,
    MalformedHeader,
    MalformedTerminator,
    TooManyParts,
    InvalidFileName,
}

impl ProtocolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotMultipart => "not_multipart",
            Self::MissingBoundary => "missing_boundary",
            Self::MissingLineTerminator => "missing_line_terminator",
            Self::LineTooLong => "line_too_long",
            Self::BoundaryMismatch => "boundary_mismatch",
            Self::MalformedHeader => "malformed_header",
            Self::MalformedTerminator => "malformed_terminator",
            Self::TooManyParts => "too_many_parts",
            Self::InvalidFileName => "invalid_file_name",
        }
    }
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised inside the decoder.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{detail}")]
    Protocol {
        kind: ProtocolErrorKind,
        detail: String,
    },

    #[error("Incomplete upload, boundary not found")]
    Incomplete,

    #[error("Failed to read upload stream: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write {name}: {source}")]
    Write { name: String, source: io::Error },

    #[error(transparent)]
    Store(StoreError),
}

impl UploadError {
    fn protocol(kind: ProtocolErrorKind, detail: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<LineError> for UploadError {
    fn from(err: LineError) -> Self {
        match err {
            LineError::EndOfStream => {
                Self::protocol(ProtocolErrorKind::MissingLineTerminator, err.to_string())
            }
            LineError::TooLong { .. } => {
                Self::protocol(ProtocolErrorKind::LineTooLong, err.to_string())
            }
            LineError::Io(e) => Self::Read(e),
        }
    }
}

impl From<HeaderError> for UploadError {
    fn from(err: HeaderError) -> Self {
        Self::protocol(ProtocolErrorKind::MalformedHeader, err.to_string())
    }
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidName(_) => {
                Self::protocol(ProtocolErrorKind::InvalidFileName, err.to_string())
            }
            other => Self::Store(other),
        }
    }
}

/// Terminal state of one decode run.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// All parts stored; names in part order
    Completed(Vec<String>),
    /// The body or its headers violate the multipart format
    ProtocolFailure {
        kind: ProtocolErrorKind,
        detail: String,
    },
    /// The stream ended early or could not be read
    StreamFailure { detail: String },
    /// A part could not be written to the store
    StorageFailure { detail: String },
}

impl DecodeOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Short machine-readable failure code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Completed(_) => "OK",
            Self::ProtocolFailure { .. } => "PROTOCOL_ERROR",
            Self::StreamFailure { .. } => "STREAM_ERROR",
            Self::StorageFailure { .. } => "STORAGE_ERROR",
        }
    }

    /// Failure description, if this is a failure.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Completed(_) => None,
            Self::ProtocolFailure { detail, .. }
            | Self::StreamFailure { detail }
            | Self::StorageFailure { detail } => Some(detail),
        }
    }
}

impl From<Result<Vec<String>, UploadError>> for DecodeOutcome {
    fn from(result: Result<Vec<String>, UploadError>) -> Self {
        match result {
            Ok(names) => Self::Completed(names),
            Err(UploadError::Protocol { kind, detail }) => Self::ProtocolFailure { kind, detail },
            Err(e @ (UploadError::Incomplete | UploadError::Read(_))) => Self::StreamFailure {
                detail: e.to_string(),
            },
            Err(e @ (UploadError::Write { .. } | UploadError::Store(_))) => Self::StorageFailure {
                detail: e.to_string(),
            },
        }
    }
}

/// Headers of one part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

impl Part {
    /// Blob name for this part, falling back to `placeholder`.
    pub fn stored_name<'a>(&'a self, placeholder: &'a str) -> &'a str {
        self.file_name.as_deref().unwrap_or(placeholder)
    }
}

/// Extract the boundary from a `multipart/form-data` content type.
pub fn boundary_from_content_type(content_type: &str) -> Result<String, UploadError> {
    let header = Header::parse(content_type)?;
    if !header.is(MULTIPART_FORM_DATA) {
        return Err(UploadError::protocol(
            ProtocolErrorKind::NotMultipart,
            format!("Not a multipart form data: {}", header.title),
        ));
    }

    match header.unquoted_param("boundary") {
        Some(boundary) if !boundary.is_empty() => Ok(boundary.to_string()),
        _ => Err(UploadError::protocol(
            ProtocolErrorKind::MissingBoundary,
            "Multipart content type has no boundary",
        )),
    }
}

/// Decodes a multipart body into blobs of a [`Store`].
pub struct MultipartDecoder<'a> {
    store: &'a Store,
    settings: DecoderSettings,
}

impl<'a> MultipartDecoder<'a> {
    pub fn new(store: &'a Store, settings: DecoderSettings) -> Self {
        Self { store, settings }
    }

    /// Decode `body`, storing every part, and report how the run ended.
    ///
    /// Parts already written before a failure stay in the store.
    #[instrument(skip(self, body))]
    pub fn decode<R: Read>(&self, content_type: &str, body: R) -> DecodeOutcome {
        let mut reader = BufReader::new(body);
        let outcome = DecodeOutcome::from(self.run(content_type, &mut reader));

        match &outcome {
            DecodeOutcome::Completed(names) => {
                info!(parts = names.len(), "Multipart upload completed");
            }
            failure => {
                warn!(
                    code = failure.code(),
                    detail = failure.detail().unwrap_or_default(),
                    "Multipart upload failed"
                );
            }
        }

        outcome
    }

    fn run<R: BufRead>(&self, content_type: &str, reader: &mut R) -> Result<Vec<String>, UploadError> {
        let boundary = format!("--{}", boundary_from_content_type(content_type)?);
        debug!(boundary = %boundary, "Boundary extracted");

        // AwaitFirstBoundary
        let first_line = read_line(reader, self.settings.max_line_len)?;
        if first_line != boundary {
            return Err(UploadError::protocol(
                ProtocolErrorKind::BoundaryMismatch,
                format!("Part not starting with boundary: {}", first_line),
            ));
        }

        let delimiter = format!("\r\n{}", boundary).into_bytes();
        let mut stored = Vec::new();

        loop {
            if stored.len() >= self.settings.max_parts {
                return Err(UploadError::protocol(
                    ProtocolErrorKind::TooManyParts,
                    format!("More than {} parts in upload", self.settings.max_parts),
                ));
            }

            let part = read_part_headers(reader, self.settings.max_line_len)?;
            let name = part.stored_name(&self.settings.placeholder_name).to_string();

            if name.starts_with(TEMP_PREFIX) {
                return Err(UploadError::protocol(
                    ProtocolErrorKind::InvalidFileName,
                    format!("Reserved file name: {}", name),
                ));
            }

            // Derivatives of `name` wait on this guard until the body is complete
            let (file, guard) = self.store.replace(&name)?;
            let mut out = BufWriter::new(file);
            let written = copy_part_body(reader, &delimiter, &mut out, &name)?;
            out.flush().map_err(|source| UploadError::Write {
                name: name.clone(),
                source,
            })?;
            drop(out);
            drop(guard);

            metrics::counter!("media.upload.parts").increment(1);
            metrics::counter!("media.upload.bytes").increment(written);
            info!(
                file_name = %name,
                content_type = part.content_type.as_deref().unwrap_or("-"),
                size_bytes = written,
                "Part stored"
            );
            stored.push(name);

            let terminator = read_line(reader, self.settings.max_line_len)?;
            match terminator.as_str() {
                "" => continue,
                "--" => return Ok(stored),
                other => {
                    return Err(UploadError::protocol(
                        ProtocolErrorKind::MalformedTerminator,
                        format!("Part not terminating with boundary--: {}", other),
                    ));
                }
            }
        }
    }
}

/// Read header lines up to the blank separator line.
fn read_part_headers<R: BufRead>(reader: &mut R, max_line_len: usize) -> Result<Part, UploadError> {
    let mut part = Part::default();

    loop {
        let line = read_line(reader, max_line_len)?;
        if line.is_empty() {
            return Ok(part);
        }
        debug!(header = %line, "Part header");

        let (key, value) = line.split_once(':').ok_or_else(|| {
            UploadError::protocol(
                ProtocolErrorKind::MalformedHeader,
                format!("Header line without ':': {}", line),
            )
        })?;
        let key = key.trim();
        let value = Header::parse(value)?;

        if key.eq_ignore_ascii_case("Content-Disposition") && value.is("form-data") {
            part.file_name = value.unquoted_param("filename").map(str::to_string);
        } else if key.eq_ignore_ascii_case("Content-Type") {
            part.content_type = Some(value.title);
        }
    }
}

/// Stream a part body into `out`, stopping at `delimiter`. Returns bytes written.
fn copy_part_body<R: BufRead, W: Write>(
    reader: &mut R,
    delimiter: &[u8],
    out: &mut W,
    name: &str,
) -> Result<u64, UploadError> {
    let mut window = RotatingWindow::new(delimiter.len()).map_err(|e| {
        UploadError::protocol(ProtocolErrorKind::MissingBoundary, e.to_string())
    })?;
    let mut written = 0u64;

    loop {
        let byte = read_byte(reader)
            .map_err(UploadError::Read)?
            .ok_or(UploadError::Incomplete)?;

        if let Some(evicted) = window.put(byte) {
            out.write_all(&[evicted]).map_err(|source| UploadError::Write {
                name: name.to_string(),
                source,
            })?;
            written += 1;
        }

        if window.matches(delimiter) {
            return Ok(written);
        }
    }
}
