//! Byte stream transports to timing hardware
//!
//! Every backend talks to its device through a [`Port`]: a serial line, a
//! TCP socket or a single-peer UDP socket. Reads are bounded by a short
//! timeout so the device thread can return to its command queue.

use serialport::{FlowControl, SerialPort};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::{debug, trace};

/// A byte stream with an optional DTR control line
pub trait Port: Read + Write + Send {
    /// Drive the DTR line, if the transport has one
    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        let _ = level;
        Err(io::Error::new(io::ErrorKind::Unsupported, "port has no DTR line"))
    }

    /// Release the underlying transport
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for Box<dyn SerialPort> {
    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.write_data_terminal_ready(level).map_err(io::Error::from)
    }
}

impl Port for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Open a serial device with DTR held low
pub fn serial(path: &str, baud: u32, rtscts: bool, timeout: Duration) -> crate::Result<Box<dyn Port>> {
    let flow = if rtscts { FlowControl::Hardware } else { FlowControl::None };
    debug!("open serial {} at {} baud", path, baud);
    let port = serialport::new(path, baud)
        .flow_control(flow)
        .timeout(timeout)
        .dtr_on_open(false)
        .open()?;
    Ok(Box::new(port))
}

/// Connect to `host` or `host:port`, using `default_port` when none is given
pub fn tcp(addr: &str, default_port: u16, timeout: Duration) -> crate::Result<Box<dyn Port>> {
    let target = resolve(addr, default_port)?;
    debug!("connecting to {}", target);
    let stream = TcpStream::connect(target)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    Ok(Box::new(stream))
}

fn resolve(addr: &str, default_port: u16) -> crate::Result<SocketAddr> {
    let found = if addr.contains(':') {
        addr.to_socket_addrs()
    } else {
        (addr, default_port).to_socket_addrs()
    };
    found
        .map_err(|_| crate::Error::Address(addr.to_string()))?
        .next()
        .ok_or_else(|| crate::Error::Address(addr.to_string()))
}

/// Serial-like view of a UDP socket exchanging datagrams with one peer
pub struct Dgram {
    sock: UdpSocket,
    peer: SocketAddr,
    buf: VecDeque<u8>,
}

impl Dgram {
    /// Bind the local `port` and talk to `host` on the same port
    pub fn open(host: &str, port: u16, timeout: Duration) -> crate::Result<Dgram> {
        let peer = resolve(host, port)?;
        let sock = UdpSocket::bind(("0.0.0.0", peer.port()))?;
        sock.set_read_timeout(Some(timeout))?;
        debug!("udp peer {}", peer);
        Ok(Dgram {
            sock,
            peer,
            buf: VecDeque::new(),
        })
    }
}

impl Read for Dgram {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buf.is_empty() {
            let mut pkt = [0u8; 4096];
            let (n, from) = self.sock.recv_from(&mut pkt)?;
            if from.ip() != self.peer.ip() || n == 0 {
                trace!("ignored {} bytes from {}", n, from);
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.buf.extend(&pkt[..n]);
        }
        let n = out.len().min(self.buf.len());
        for (dst, src) in out.iter_mut().zip(self.buf.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for Dgram {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sock.send_to(buf, self.peer)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for Dgram {}

/// An open port with a byte-at-a-time read buffer
pub struct Wire {
    port: Box<dyn Port>,
    inbuf: VecDeque<u8>,
}

impl Wire {
    pub fn new(port: Box<dyn Port>) -> Wire {
        Wire {
            port,
            inbuf: VecDeque::new(),
        }
    }

    /// Next byte from the device, `None` when the read timed out
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.inbuf.is_empty() {
            let mut chunk = [0u8; 512];
            match self.port.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ))
                }
                Ok(n) => self.inbuf.extend(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Ok(self.inbuf.pop_front())
    }

    pub fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        trace!("send {:?}", String::from_utf8_lossy(msg));
        self.port.write_all(msg)?;
        self.port.flush()
    }

    pub fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port.set_dtr(level)
    }

    pub fn close(mut self) {
        if let Err(e) = self.port.shutdown() {
            debug!("shutdown port: {}", e);
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Latin-1 bytes to text
pub fn decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Text to Latin-1 bytes, dropping characters that do not fit
pub fn encode(text: &str) -> Vec<u8> {
    text.chars()
        .filter_map(|c| u8::try_from(c as u32).ok())
        .collect()
}
