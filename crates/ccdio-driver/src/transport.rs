//! Line-oriented SCPI transport
//!
//! Every call carries its own deadline; nothing blocks forever. Socket
//! timeouts are mapped to [`DioError::Timeout`], every other socket failure to
//! [`DioError::Communication`] carrying the endpoint.

use std::fmt::Debug;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use ccdio_chip::scpi;
use tracing::debug;

use crate::error::{DioError, Result};

/// Command/response channel to one instrument
pub trait Transport: Debug + Send {
    /// Endpoint description used in errors and logs
    fn endpoint(&self) -> &str;

    /// Send a command that has no response
    ///
    /// # Errors
    ///
    /// Returns error if the write fails or exceeds `timeout`.
    fn send(&mut self, command: &str, timeout: Duration) -> Result<()>;

    /// Send a query and return its response line, terminator stripped
    ///
    /// # Errors
    ///
    /// Returns error if the exchange fails or exceeds `timeout`.
    fn query(&mut self, command: &str, timeout: Duration) -> Result<String>;

    /// Send `header` followed by `payload` as a definite-length block
    ///
    /// # Errors
    ///
    /// Returns error if the write fails or exceeds `timeout`.
    fn send_block(&mut self, header: &str, payload: &[u8], timeout: Duration) -> Result<()>;
}

/// Frame `header` + `#<n><len>` + `payload` + terminator.
pub(crate) fn block_frame(header: &str, payload: &[u8]) -> BytesMut {
    let prefix = scpi::block_header(payload.len());
    let mut frame = BytesMut::with_capacity(header.len() + prefix.len() + payload.len() + 1);
    frame.put_slice(header.as_bytes());
    frame.put_slice(prefix.as_bytes());
    frame.put_slice(payload);
    frame.put_u8(b'\n');
    frame
}

/// SCPI over a raw TCP socket
#[derive(Debug)]
pub struct IpTransport {
    endpoint: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl IpTransport {
    /// Connect to `host:port`
    ///
    /// # Errors
    ///
    /// Returns error if the address does not resolve or nobody answers
    /// within `timeout`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let endpoint = format!("{host}:{port}");
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| DioError::communication(&endpoint, format!("resolve: {e}")))?;

        let mut last = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| DioError::communication(&endpoint, e.to_string()))?;
                    let writer = stream
                        .try_clone()
                        .map_err(|e| DioError::communication(&endpoint, e.to_string()))?;
                    tracing::info!("Connected to {endpoint}");
                    return Ok(Self {
                        endpoint,
                        reader: BufReader::new(stream),
                        writer,
                    });
                }
                Err(e) => last = Some(e),
            }
        }

        Err(match last {
            Some(e) => map_io(&endpoint, "connect", timeout, e),
            None => DioError::communication(&endpoint, "no address"),
        })
    }

    fn write_all(&mut self, bytes: &[u8], what: &str, timeout: Duration) -> Result<()> {
        self.writer
            .set_write_timeout(Some(timeout))
            .map_err(|e| DioError::communication(&self.endpoint, e.to_string()))?;
        self.writer
            .write_all(bytes)
            .and_then(|()| self.writer.flush())
            .map_err(|e| map_io(&self.endpoint, what, timeout, e))
    }
}

fn map_io(endpoint: &str, what: &str, timeout: Duration, err: io::Error) -> DioError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            DioError::timeout(format!("{what} on {endpoint}"), timeout)
        }
        _ => DioError::communication(endpoint, format!("{what}: {err}")),
    }
}

impl Transport for IpTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn send(&mut self, command: &str, timeout: Duration) -> Result<()> {
        debug!("{} <- {command}", self.endpoint);
        let line = format!("{command}{}", scpi::TERMINATOR);
        self.write_all(line.as_bytes(), command, timeout)
    }

    fn query(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.send(command, timeout)?;
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(|e| DioError::communication(&self.endpoint, e.to_string()))?;

        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| map_io(&self.endpoint, command, timeout, e))?;
        if n == 0 {
            return Err(DioError::communication(&self.endpoint, "connection closed"));
        }
        let response = line.trim_end_matches(['\r', '\n']).to_string();
        debug!("{} -> {response}", self.endpoint);
        Ok(response)
    }

    fn send_block(&mut self, header: &str, payload: &[u8], timeout: Duration) -> Result<()> {
        debug!("{} <- {header}<{} byte block>", self.endpoint, payload.len());
        let frame = block_frame(header, payload);
        self.write_all(&frame, header.trim_end(), timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn block_frame_layout() {
        let frame = block_frame("CMD ", b"abc");
        assert_eq!(&frame[..], b"CMD #13abc\n");
    }

    #[test]
    fn query_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"*IDN?\n");
            sock.write_all(b"QuTech,CC,DC-001,1.0\r\n").unwrap();
        });

        let mut t = IpTransport::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let idn = t.query("*IDN?", Duration::from_secs(2)).unwrap();
        assert_eq!(idn, "QuTech,CC,DC-001,1.0");
        server.join().unwrap();
    }

    #[test]
    fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(sock);
        });

        let mut t = IpTransport::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let err = t.query("*OPC?", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, DioError::Timeout { .. }), "{err}");
        server.join().unwrap();
    }
}
