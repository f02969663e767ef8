//! TCP push transport
//!
//! Frames are newline-terminated JSON objects `{"event": ..., "data": ...}`.
//! A reader thread owns the connection: it connects, reads frames, and on
//! any failure reconnects with exponential backoff until `disconnect()`.

use super::{PushTransport, TransportError, TransportEvent};

use crossbeam::channel;
use serde::Deserialize;
use serde_json::Value;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Exponential reconnect delay, doubling from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Backoff {
        let max = max.max(min);
        Backoff {
            min,
            max,
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Splits complete lines off the front of a receive buffer.
fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = buf.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = buf.drain(..=end).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}

fn parse_frame(line: &[u8]) -> Option<TransportEvent> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    match serde_json::from_slice::<Frame>(line) {
        Ok(frame) => Some(TransportEvent::Message {
            event: frame.event,
            data: frame.data,
        }),
        Err(e) => {
            warn!("malformed push frame: {}", e);
            None
        }
    }
}

struct Link {
    addr: String,
    connect_timeout: Duration,
    backoff: Backoff,
    stop: Arc<AtomicBool>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    sink: channel::Sender<TransportEvent>,
}

impl Link {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sends an event unless stopped. Returns false if the receiver is gone.
    fn send(&self, event: TransportEvent) -> bool {
        if self.stopped() {
            return false;
        }
        self.sink.send(event).is_ok()
    }

    fn open(&self) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = self.addr.to_socket_addrs()?.collect();
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(READ_TIMEOUT))?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Reads frames until the connection drops or the transport is stopped.
    fn pump(&self, mut stream: TcpStream) -> io::Result<()> {
        let mut rxbuf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        while !self.stopped() {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    rxbuf.extend_from_slice(&chunk[..n]);
                    while let Some(line) = take_line(&mut rxbuf) {
                        if let Some(event) = parse_frame(&line) {
                            if !self.send(event) {
                                return Ok(());
                            }
                        }
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn sleep(&self, delay: Duration) {
        let mut left = delay;
        while !left.is_zero() && !self.stopped() {
            let slice = left.min(SLEEP_SLICE);
            thread::sleep(slice);
            left -= slice;
        }
    }

    fn run(mut self) {
        while !self.stopped() {
            if !self.send(TransportEvent::Connecting) {
                break;
            }
            match self.open() {
                Ok(stream) => {
                    if let Ok(mut slot) = self.stream.lock() {
                        *slot = stream.try_clone().ok();
                    }
                    self.backoff.reset();
                    if !self.send(TransportEvent::Connected) {
                        break;
                    }
                    match self.pump(stream) {
                        Ok(()) => debug!("push connection to {} closed", self.addr),
                        Err(e) => debug!("push connection to {} lost: {}", self.addr, e),
                    }
                    if let Ok(mut slot) = self.stream.lock() {
                        *slot = None;
                    }
                    if !self.send(TransportEvent::Disconnected) {
                        break;
                    }
                }
                Err(e) => {
                    if !self.send(TransportEvent::Error(format!("{}: {}", self.addr, e))) {
                        break;
                    }
                }
            }
            let delay = self.backoff.next_delay();
            debug!("reconnecting to {} in {:?}", self.addr, delay);
            self.sleep(delay);
        }
    }
}

/// Push transport over a plain TCP connection.
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
    backoff: Backoff,
    stop: Arc<AtomicBool>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(addr: &str, backoff: Backoff, connect_timeout: Duration) -> TcpTransport {
        TcpTransport {
            addr: addr.to_string(),
            connect_timeout,
            backoff,
            stop: Arc::new(AtomicBool::new(false)),
            stream: Arc::new(Mutex::new(None)),
            thread: None,
        }
    }
}

impl PushTransport for TcpTransport {
    fn connect(&mut self, sink: channel::Sender<TransportEvent>) -> Result<(), TransportError> {
        if self.thread.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        self.stop = Arc::new(AtomicBool::new(false));
        let link = Link {
            addr: self.addr.clone(),
            connect_timeout: self.connect_timeout,
            backoff: self.backoff.clone(),
            stop: self.stop.clone(),
            stream: self.stream.clone(),
            sink,
        };
        let handle = thread::Builder::new()
            .name("push-transport".to_string())
            .spawn(move || link.run())?;
        self.thread = Some(handle);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.stream.lock() {
            if let Some(stream) = slot.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("push transport thread panicked");
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
