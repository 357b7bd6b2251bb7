//! Blocking line-oriented connection used by the POP3 and IMAP adapters.
//!
//! Plain TCP or implicit TLS via rustls. Meant to be driven from
//! `spawn_blocking`; every call blocks the current thread.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use rustls_pki_types::ServerName;

use crate::error::SourceError;

/// Socket read timeout, so a stalled server surfaces as an I/O error.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// A connected, buffered mail protocol session.
pub struct Connection {
    protocol: &'static str,
    reader: BufReader<Stream>,
}

impl Connection {
    /// Open a TCP connection, wrapping it in TLS when `use_tls` is set.
    pub fn connect(
        protocol: &'static str,
        host: &str,
        port: u16,
        use_tls: bool,
    ) -> Result<Self, SourceError> {
        let addr = format!("{host}:{port}");
        let tcp = TcpStream::connect((host, port)).map_err(|e| SourceError::Connect {
            protocol,
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|source| SourceError::Io { protocol, source })?;

        let stream = if use_tls {
            Stream::Tls(Box::new(wrap_tls(protocol, host, tcp)?))
        } else {
            Stream::Plain(tcp)
        };

        Ok(Self {
            protocol,
            reader: BufReader::new(stream),
        })
    }

    /// Read one line, without its trailing CRLF.
    pub fn read_line(&mut self) -> Result<String, SourceError> {
        let raw = self.read_raw_line()?;
        let line = String::from_utf8_lossy(&raw);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read one line including its line terminator, as raw bytes.
    pub fn read_raw_line(&mut self) -> Result<Vec<u8>, SourceError> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf).map_err(|e| self.io(e))?;
        if n == 0 {
            return Err(self.io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        Ok(buf)
    }

    /// Read exactly `len` bytes (IMAP literals).
    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, SourceError> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).map_err(|e| self.io(e))?;
        Ok(buf)
    }

    /// Send one command line; CRLF is appended.
    pub fn write_line(&mut self, line: &str) -> Result<(), SourceError> {
        let stream = self.reader.get_mut();
        let result = stream
            .write_all(line.as_bytes())
            .and_then(|()| stream.write_all(b"\r\n"))
            .and_then(|()| stream.flush());
        result.map_err(|e| self.io(e))
    }

    fn io(&self, source: io::Error) -> SourceError {
        SourceError::Io {
            protocol: self.protocol,
            source,
        }
    }
}

fn wrap_tls(
    protocol: &'static str,
    host: &str,
    tcp: TcpStream,
) -> Result<StreamOwned<ClientConnection, TcpStream>, SourceError> {
    let tls_err = |reason: String| SourceError::Tls { protocol, reason };

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| tls_err(e.to_string()))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    let server_name =
        ServerName::try_from(host.to_string()).map_err(|e| tls_err(e.to_string()))?;
    let conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| tls_err(e.to_string()))?;
    Ok(StreamOwned::new(conn, tcp))
}
