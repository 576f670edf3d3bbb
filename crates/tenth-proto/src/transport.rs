//! Length-capped line framing over TCP or TLS.
//!
//! A connection splits into a [`TransportReader`] and a
//! [`TransportWriter`] so the reading and writing tasks own their
//! halves independently. A line is CR- or LF-terminated and at most
//! 512 bytes including the terminator; an over-long line is consumed
//! to its terminator and reported without closing the connection.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::message::MAX_LINE_LEN;

/// Errors surfaced by [`TransportReader::read_line`].
#[derive(Debug)]
pub enum TransportReadError {
    Io(std::io::Error),
    /// Line exceeded [`MAX_LINE_LEN`]; carries the consumed length.
    LineTooLong(usize),
}

impl From<std::io::Error> for TransportReadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// The inbound half of a framed byte stream.
pub enum TransportReader {
    Tcp(BufReader<tokio::net::tcp::OwnedReadHalf>),
    Tls(BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>),
}

/// The outbound half.
pub enum TransportWriter {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

/// Split a plain TCP stream into framed halves.
pub fn tcp(stream: TcpStream) -> (TransportReader, TransportWriter) {
    let (read, write) = stream.into_split();
    (
        TransportReader::Tcp(BufReader::new(read)),
        TransportWriter::Tcp(write),
    )
}

/// Split a server-side TLS stream into framed halves.
pub fn tls(stream: TlsStream<TcpStream>) -> (TransportReader, TransportWriter) {
    let (read, write) = tokio::io::split(stream);
    (
        TransportReader::Tls(BufReader::new(read)),
        TransportWriter::Tls(write),
    )
}

impl TransportReader {
    /// Read one line, stripped of CR/LF. `Ok(None)` on clean EOF.
    /// Empty lines come back as `Some("")`; the engine ignores them.
    pub async fn read_line(&mut self) -> Result<Option<String>, TransportReadError> {
        match self {
            TransportReader::Tcp(reader) => read_line_limited(reader).await,
            TransportReader::Tls(reader) => read_line_limited(reader).await,
        }
    }
}

impl TransportWriter {
    /// Write a pre-rendered line (terminator included).
    pub async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            TransportWriter::Tcp(writer) => {
                writer.write_all(bytes).await?;
                writer.flush().await
            }
            TransportWriter::Tls(writer) => {
                writer.write_all(bytes).await?;
                writer.flush().await
            }
        }
    }
}

async fn read_line_limited<R>(
    reader: &mut BufReader<R>,
) -> Result<Option<String>, TransportReadError>
where
    R: AsyncRead + Unpin,
{
    let mut line: Vec<u8> = Vec::with_capacity(128);
    let mut consumed_total = 0usize;
    let mut exceeded = false;

    loop {
        let buffer = reader.fill_buf().await?;

        if buffer.is_empty() {
            if line.is_empty() && !exceeded {
                return Ok(None);
            }
            break;
        }

        let newline_pos = buffer.iter().position(|&b| b == b'\n' || b == b'\r');
        let to_consume = match newline_pos {
            // CR-LF is one terminator when both bytes are in view.
            Some(idx) if buffer[idx] == b'\r' && buffer.get(idx + 1) == Some(&b'\n') => idx + 2,
            Some(idx) => idx + 1,
            None => buffer.len(),
        };
        consumed_total += to_consume;

        if !exceeded {
            if line.len() + to_consume > MAX_LINE_LEN {
                exceeded = true;
            } else {
                line.extend_from_slice(&buffer[..to_consume]);
            }
        }

        reader.consume(to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    if exceeded {
        tracing::warn!(length = consumed_total, "line exceeds {} byte limit", MAX_LINE_LEN);
        return Err(TransportReadError::LineTooLong(consumed_total));
    }

    while matches!(line.last(), Some(b'\r') | Some(b'\n')) {
        line.pop();
    }

    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all_lines(data: &[u8]) -> Vec<Result<Option<String>, TransportReadError>> {
        let mut reader = BufReader::new(data);
        let mut out = Vec::new();
        loop {
            let r = read_line_limited(&mut reader).await;
            let done = matches!(r, Ok(None));
            out.push(r);
            if done {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn test_reads_crlf_lines() {
        let lines = read_all_lines(b"PING :x\r\nNICK foo\r\n").await;
        assert!(matches!(&lines[0], Ok(Some(s)) if s == "PING :x"));
        assert!(matches!(&lines[1], Ok(Some(s)) if s == "NICK foo"));
        assert!(matches!(&lines[2], Ok(None)));
    }

    #[tokio::test]
    async fn test_reads_bare_lf_and_final_fragment() {
        let lines = read_all_lines(b"QUIT\nTRAILING").await;
        assert!(matches!(&lines[0], Ok(Some(s)) if s == "QUIT"));
        assert!(matches!(&lines[1], Ok(Some(s)) if s == "TRAILING"));
    }

    #[tokio::test]
    async fn test_over_long_line_is_reported() {
        let mut data = vec![b'a'; 600];
        data.extend_from_slice(b"\r\nPING\r\n");
        let mut reader = BufReader::new(&data[..]);

        let first = read_line_limited(&mut reader).await;
        assert!(matches!(first, Err(TransportReadError::LineTooLong(_))));

        // The stream resynchronizes on the next line.
        let second = read_line_limited(&mut reader).await.unwrap();
        assert_eq!(second.as_deref(), Some("PING"));
    }
}
