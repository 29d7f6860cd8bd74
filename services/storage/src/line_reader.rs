//! CRLF-terminated line reading over a blocking byte stream.

use std::io::{self, BufRead, ErrorKind};

/// Default upper bound for a single protocol line.
pub const DEFAULT_MAX_LINE_LEN: usize = 8 * 1024;

/// Errors that can occur while reading a line.
#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("No EOL found before end of stream")]
    EndOfStream,

    #[error("Line exceeds {max} bytes")]
    TooLong { max: usize },

    #[error("Read failed: {0}")]
    Io(#[from] io::Error),
}

/// Read a single byte, retrying on interruption. `None` means end of stream.
pub fn read_byte<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Option<u8>> {
    loop {
        match reader.fill_buf() {
            Ok([]) => return Ok(None),
            Ok(buf) => {
                let byte = buf[0];
                reader.consume(1);
                return Ok(Some(byte));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read bytes up to the next CR LF pair and return them as text.
///
/// The terminator is consumed and not included. A CR that is not followed by
/// LF is kept as ordinary content. Bytes map one-to-one onto characters
/// (ISO-8859-1), which is how header lines are defined on the wire.
pub fn read_line<R: BufRead + ?Sized>(reader: &mut R, max_len: usize) -> Result<String, LineError> {
    let mut line = String::new();
    // Wire bytes in `line`; high Latin-1 bytes take two bytes of UTF-8
    let mut len = 0usize;
    let mut pending_cr = false;

    loop {
        let byte = read_byte(reader)?.ok_or(LineError::EndOfStream)?;

        if pending_cr {
            if byte == b'\n' {
                return Ok(line);
            }
            line.push('\r');
            len += 1;
            pending_cr = false;
        }

        if byte == b'\r' {
            pending_cr = true;
        } else {
            line.push(char::from(byte));
            len += 1;
        }

        if len > max_len {
            return Err(LineError::TooLong { max: max_len });
        }
    }
}
