//! Byte transport boundary.
//!
//! The device core needs only three things from its link: write bytes, ask
//! how many bytes are waiting, and take one byte. Writes from the foreground
//! loop are issued whole-frame so replies never interleave.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use serialport::SerialPort;

use crate::errors::Result;

/// Default serial baud rate.
pub const BAUD_RATE: u32 = 115_200;

/// Default timeout for blocking serial and in-memory reads.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

pub trait Transport {
    /// Write a complete frame.
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()>;

    /// Number of received bytes ready to read.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Take one received byte, or `None` if nothing is waiting.
    fn read_byte(&mut self) -> Result<Option<u8>>;
}

// ============================================================================
// Serial Port
// ============================================================================

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open a serial device (e.g. `/dev/ttyUSB0`) at `baud`, 8N1, no flow control.
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(DEFAULT_TIMEOUT)
            .open()?;
        debug!("Opened serial port {} at {} baud", path, baud);
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.bytes_available()? == 0 {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(1) => Ok(Some(byte[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// In-memory Link
// ============================================================================

#[derive(Default)]
struct Pipe {
    bytes: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One end of an in-process full-duplex byte link.
///
/// Implements both [`Transport`] (for the device side) and `Read`/`Write`
/// (for the host client). Reads block up to `timeout` and then fail with
/// `TimedOut`, like a serial port with a read timeout.
#[derive(Clone)]
pub struct MemoryLink {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    timeout: Duration,
}

impl MemoryLink {
    /// Create two connected ends.
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        (
            MemoryLink {
                rx: Arc::clone(&a),
                tx: Arc::clone(&b),
                timeout: DEFAULT_TIMEOUT,
            },
            MemoryLink {
                rx: b,
                tx: a,
                timeout: DEFAULT_TIMEOUT,
            },
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Drain everything received so far without blocking.
    pub fn take_received(&self) -> Vec<u8> {
        self.rx.lock().drain(..).collect()
    }

    fn push(&self, bytes: &[u8]) {
        self.tx.lock().extend(bytes);
        self.tx.ready.notify_all();
    }
}

impl Transport for MemoryLink {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        self.push(bytes);
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.rx.lock().len())
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.rx.lock().pop_front())
    }
}

impl Read for MemoryLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let guard = self.rx.lock();
        let (mut queue, wait) = self
            .rx
            .ready
            .wait_timeout_while(guard, self.timeout, |q| q.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        if wait.timed_out() && queue.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "memory link read timed out"));
        }
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn memory_link_is_full_duplex() {
        let (mut device, mut host) = MemoryLink::pair();
        host.write_all(b"RS").unwrap();
        assert_eq!(device.bytes_available().unwrap(), 2);
        assert_eq!(device.read_byte().unwrap(), Some(b'R'));
        assert_eq!(device.read_byte().unwrap(), Some(b'S'));
        assert_eq!(device.read_byte().unwrap(), None);

        device.write_frame(&[b'X', 1, 0]).unwrap();
        let mut reply = [0u8; 3];
        host.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [b'X', 1, 0]);
    }

    #[test]
    fn single_byte_replies_use_write_frame() {
        let (mut device, mut host) = MemoryLink::pair();
        let link: &mut dyn Transport = &mut device;
        link.write_frame(&[0x55]).unwrap();
        let mut byte = [0u8; 1];
        host.read_exact(&mut byte).unwrap();
        assert_eq!(byte, [0x55]);
    }

    #[test]
    fn memory_link_read_times_out() {
        let (_device, host) = MemoryLink::pair();
        let mut host = host.with_timeout(Duration::from_millis(10));
        let mut buf = [0u8; 4];
        let err = host.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn memory_link_read_wakes_on_write() {
        let (mut device, host) = MemoryLink::pair();
        let mut host = host.with_timeout(Duration::from_secs(5));
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 2];
            host.read_exact(&mut buf).map(|_| buf)
        });
        thread::sleep(Duration::from_millis(20));
        device.write_frame(&[7, 8]).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), [7, 8]);
    }
}
