//! Serial transport.
//!
//! Owns the port exclusively, writes bytes, and delivers inbound bytes to the
//! engine. Configuration (raw mode, baud, 8-N-1, no flow control) and the
//! dedicated-I/O-thread shape are grounded on the teacher's native serial
//! driver (`modem.rs`): a `std::thread` owns the fd so a wedged or silent
//! modem never blocks the tokio runtime. Unlike the teacher's one-shot
//! request/response channel, this transport streams: the engine, not the
//! transport, owns command/response correlation, so the I/O thread just
//! forwards whatever arrives and drains a queue of pending writes.

use std::fmt;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read buffer size per poll.
const READ_BUF_SIZE: usize = 1024;
/// Capacity of the inbound byte channel.
const INBOUND_CHANNEL_CAPACITY: usize = 64;
/// Capacity of the outbound write-request channel.
const WRITE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}
impl std::error::Error for TransportError {}

/// Cloneable handle to an open serial port. Cloning clones the write sender;
/// all writes are serialized through the I/O thread.
#[derive(Clone)]
pub struct Transport {
    write_tx: mpsc::Sender<Vec<u8>>,
    path: String,
}

impl Transport {
    /// Open a serial device path (e.g. `/dev/ttyUSB0`) and spawn the I/O
    /// thread. Returns the handle plus the inbound byte receiver, which the
    /// caller (the engine) takes ownership of.
    pub fn open(path: &str, baud: u32) -> Result<(Self, mpsc::Receiver<Vec<u8>>), TransportError> {
        let fd = fcntl::open(
            path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| TransportError(format!("open {path}: {e}")))?;

        let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL)
            .map_err(|e| TransportError(format!("F_GETFL: {e}")))?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.remove(OFlag::O_NONBLOCK);
        fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags))
            .map_err(|e| TransportError(format!("F_SETFL: {e}")))?;

        configure_termios(fd, baud)?;

        // SAFETY: fd was just opened above and is valid for this call.
        unsafe {
            termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH)
                .map_err(|e| TransportError(format!("tcflush: {e}")))?;
        }

        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(WRITE_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(INBOUND_CHANNEL_CAPACITY);
        let dev_name = path.to_string();

        std::thread::Builder::new()
            .name(format!("sim800l-io-{dev_name}"))
            .spawn(move || io_thread(fd, write_rx, inbound_tx, &dev_name))
            .map_err(|e| TransportError(format!("spawn I/O thread: {e}")))?;

        debug!("transport {path}: opened ({baud} 8N1)");

        Ok((
            Self {
                write_tx,
                path: path.to_string(),
            },
            inbound_rx,
        ))
    }

    /// Queue bytes for the I/O thread to write. Returns once the write has
    /// been handed off, not once it reaches the wire.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.write_tx
            .send(bytes)
            .await
            .map_err(|_| TransportError(format!("transport {} I/O thread gone", self.path)))
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A [`Transport`] paired with the channel ends normally owned by the I/O
/// thread, for driving the engine against a fake modem in tests.
pub struct TestHarness {
    pub transport: Transport,
    /// Bytes the engine wrote, in order.
    pub write_rx: mpsc::Receiver<Vec<u8>>,
    /// Feed bytes into the engine as if they arrived from the modem.
    pub inbound_tx: mpsc::Sender<Vec<u8>>,
    /// Passed to `engine::start` in place of a real transport's inbound receiver.
    pub inbound_rx: mpsc::Receiver<Vec<u8>>,
}

/// Builds a loopback-free [`Transport`] with no backing I/O thread. Test-only:
/// bypasses the real serial port entirely.
#[doc(hidden)]
#[must_use]
pub fn test_pair() -> TestHarness {
    let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    TestHarness {
        transport: Transport {
            write_tx,
            path: "test".to_string(),
        },
        write_rx,
        inbound_tx,
        inbound_rx,
    }
}

/// SAFETY: caller must ensure `fd` is a valid open file descriptor for the
/// lifetime of the borrow.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

fn configure_termios(fd: RawFd, baud: u32) -> Result<(), TransportError> {
    let borrowed = unsafe { borrow_fd(fd) };
    let mut tio =
        termios::tcgetattr(borrowed).map_err(|e| TransportError(format!("tcgetattr: {e}")))?;

    termios::cfmakeraw(&mut tio);

    let baud_rate = baud_rate_from_u32(baud)?;
    termios::cfsetispeed(&mut tio, baud_rate)
        .map_err(|e| TransportError(format!("cfsetispeed: {e}")))?;
    termios::cfsetospeed(&mut tio, baud_rate)
        .map_err(|e| TransportError(format!("cfsetospeed: {e}")))?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    // VMIN=0, VTIME=1 → read returns after 100ms idle or when data arrives.
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)
        .map_err(|e| TransportError(format!("tcsetattr: {e}")))?;

    Ok(())
}

fn baud_rate_from_u32(baud: u32) -> Result<termios::BaudRate, TransportError> {
    use termios::BaudRate;
    match baud {
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115_200 => Ok(BaudRate::B115200),
        other => Err(TransportError(format!("unsupported baud rate: {other}"))),
    }
}

/// Blocking I/O thread: alternates between draining pending writes and
/// polling the fd for inbound bytes, forwarding whatever arrives.
fn io_thread(
    fd: RawFd,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    device: &str,
) {
    loop {
        while let Ok(bytes) = write_rx.try_recv() {
            let borrowed = unsafe { borrow_fd(fd) };
            if let Err(e) = unistd::write(borrowed, &bytes) {
                warn!("transport {device}: write failed: {e}");
            }
        }

        let mut buf = [0u8; READ_BUF_SIZE];
        match unistd::read(fd, &mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if inbound_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    debug!("transport {device}: engine gone, stopping I/O thread");
                    break;
                }
            }
            Err(nix::errno::Errno::EAGAIN) => {}
            Err(e) => {
                warn!("transport {device}: read error: {e}");
                break;
            }
        }

        if write_rx.is_closed() {
            debug!("transport {device}: write channel closed, stopping I/O thread");
            break;
        }
    }

    let _ = unistd::close(fd);
}
