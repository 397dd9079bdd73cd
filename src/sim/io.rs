//! Character-stream IO for the simulated program.
//!
//! The simulated program sees three byte streams: stdin, stdout, and stderr.
//! The interface for stream backends is defined with the [`CharIO`] trait.
//! This is exposed to the simulator with the [`SimIO`] enum.
//!
//! Besides those two key items, this module also includes:
//! - [`EmptyIO`]: A `CharIO` holding the implementation for a lack of IO support.
//! - [`BufferedIO`]: A `CharIO` holding a buffered implementation for IO.
//! - [`BiChannelIO`]: A `CharIO` holding a threaded/channel implementation for IO.
//! - [`CustomIO`]: A `CharIO` that can be used to wrap around custom IO implementations.
//!
//! Reads from stdin are the only operation in the simulator that may block:
//! [`BiChannelIO`] waits until a byte arrives or the input is closed.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::thread::JoinHandle;

use crossbeam_channel as cbc;

/// An output stream of the simulated program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// A character-stream IO backend.
pub trait CharIO {
    /// Reads the next byte of input.
    ///
    /// This returns `None` if no more input is available.
    fn read_char(&self) -> Option<u8>;

    /// Writes a byte to the given output stream.
    ///
    /// This returns whether the write was successful or not.
    fn write_char(&self, stream: Stream, byte: u8) -> bool;

    /// Closes this backend. It should not be used after this point.
    fn close(&mut self) {}
}
impl dyn CharIO {} // assert CharIO is dyn safe

/// No IO. All reads find no input and all writes are unsuccessful.
pub struct EmptyIO;
impl CharIO for EmptyIO {
    fn read_char(&self) -> Option<u8> {
        None
    }

    fn write_char(&self, _stream: Stream, _byte: u8) -> bool {
        false
    }
}

fn write_guard<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// IO that reads from an input buffer and writes to output buffers.
///
/// The buffers can be accessed in code via [`BufferedIO::get_input`], [`BufferedIO::get_output`],
/// and [`BufferedIO::get_error`].
///
/// Note that while a lock guard is held on one of these buffers,
/// the simulator blocks when it accesses that buffer.
/// Thus, a lock guard should never be leaked.
#[derive(Clone, Default)]
pub struct BufferedIO {
    input: Arc<RwLock<VecDeque<u8>>>,
    output: Arc<RwLock<Vec<u8>>>,
    error: Arc<RwLock<Vec<u8>>>,
}
impl BufferedIO {
    /// Creates a new BufferedIO.
    pub fn new() -> Self {
        Self::default()
    }
    /// Creates a new BufferedIO whose input buffer starts with the given bytes.
    pub fn with_input(input: &[u8]) -> Self {
        let io = Self::new();
        write_guard(&io.input).extend(input);
        io
    }

    /// Gets a reference to the input buffer.
    pub fn get_input(&self) -> &Arc<RwLock<VecDeque<u8>>> {
        &self.input
    }
    /// Gets a reference to the stdout buffer.
    pub fn get_output(&self) -> &Arc<RwLock<Vec<u8>>> {
        &self.output
    }
    /// Gets a reference to the stderr buffer.
    pub fn get_error(&self) -> &Arc<RwLock<Vec<u8>>> {
        &self.error
    }

    /// Takes everything written to stdout so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *write_guard(&self.output))
    }
}
impl CharIO for BufferedIO {
    fn read_char(&self) -> Option<u8> {
        write_guard(&self.input).pop_front()
    }

    fn write_char(&self, stream: Stream, byte: u8) -> bool {
        let buf = match stream {
            Stream::Stdout => &self.output,
            Stream::Stderr => &self.error,
        };
        write_guard(buf).push(byte);
        true
    }
}

/// A helper struct for [`BiChannelIO::new`],
/// indicating the channel is closed and no more reads/writes will come from it.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Stop;

/// An IO that reads from one channel and writes to another.
///
/// Input is produced by a reader thread, one byte at a time.
/// [`CharIO::read_char`] blocks until the reader has produced a byte, or until the reader stops.
///
/// Output is consumed by a writer thread, which receives each byte with the stream it was written to.
pub struct BiChannelIO {
    read_data: cbc::Receiver<u8>,
    #[allow(unused)]
    read_handler: JoinHandle<()>,

    write_data: Option<cbc::Sender<(Stream, u8)>>,
    write_handler: Option<JoinHandle<()>>,
}
impl BiChannelIO {
    /// Creates a new bi-channel IO device with the given reader and writer.
    ///
    /// The reader function is called every time the input needs a byte.
    /// It should block until a byte is ready, or return Stop
    /// if there are no more bytes to read.
    ///
    /// The writer function is called every time a byte is written to either output stream.
    ///
    /// This uses threads to read and write from input and output. As such,
    /// the reader keeps being polled even while the simulator is not running.
    pub fn new(
        mut reader: impl FnMut() -> Result<u8, Stop> + Send + 'static,
        mut writer: impl FnMut(Stream, u8) -> Result<(), Stop> + Send + 'static
    ) -> Self {
        let (read_tx, read_rx) = cbc::bounded(1);
        let (write_tx, write_rx) = cbc::unbounded();

        // Reader thread:
        let read_handler = std::thread::spawn(move || loop {
            let Ok(byte) = reader() else { return };
            let Ok(()) = read_tx.send(byte) else { return };
        });

        // Writer thread:
        let write_handler = std::thread::spawn(move || {
            for (stream, byte) in write_rx {
                let Ok(()) = writer(stream, byte) else { return };
            }
        });

        Self {
            read_data: read_rx,
            read_handler,
            write_data: Some(write_tx),
            write_handler: Some(write_handler),
        }
    }

    /// Creates a bi-channel IO device bound to the host's stdin, stdout, and stderr.
    ///
    /// Note that due to how stdin works in terminals, data is only sent once a new line is typed.
    /// Additionally, this flushes the output stream every time a byte is written.
    pub fn stdio() -> Self {
        use std::io::{self, BufRead, Write};

        Self::new(
            || {
                let mut stdin = io::stdin().lock();
                let &[byte, ..] = stdin.fill_buf().map_err(|_| Stop)? else {
                    return Err(Stop);
                };

                stdin.consume(1);
                Ok(byte)
            },
            |stream, byte| {
                let result = match stream {
                    Stream::Stdout => io::stdout().write_all(&[byte]).and_then(|_| io::stdout().flush()),
                    Stream::Stderr => io::stderr().write_all(&[byte]).and_then(|_| io::stderr().flush()),
                };
                result.map_err(|_| Stop)
            }
        )
    }
}
impl CharIO for BiChannelIO {
    fn read_char(&self) -> Option<u8> {
        // disconnection means the reader stopped (or panicked)
        self.read_data.recv().ok()
    }

    fn write_char(&self, stream: Stream, byte: u8) -> bool {
        self.write_data.as_ref()
            .is_some_and(|tx| tx.send((stream, byte)).is_ok())
    }

    fn close(&mut self) {
        // Drop the write channel so the writer drains and exits.
        self.write_data.take();

        // The reader can hang on reading, so it is not joined.
        if let Some(handler) = self.write_handler.take() {
            let _ = handler.join();
        }
    }
}
impl Drop for BiChannelIO {
    fn drop(&mut self) {
        self.close();
    }
}

/// An opaque box that holds custom defined IO.
///
/// This can be used to use a different implementation of IO
/// than the ones implemented in this module.
pub struct CustomIO(Box<dyn CharIO + Send + Sync>);
impl CustomIO {
    /// Creates a new custom IO.
    pub fn new(device: impl CharIO + Send + Sync + 'static) -> Self {
        CustomIO(Box::new(device))
    }
}
impl CharIO for CustomIO {
    fn read_char(&self) -> Option<u8> {
        self.0.read_char()
    }

    fn write_char(&self, stream: Stream, byte: u8) -> bool {
        self.0.write_char(stream, byte)
    }

    fn close(&mut self) {
        self.0.close()
    }
}

/// All the variants of IO accepted by the Simulator.
#[derive(Default)]
pub enum SimIO {
    /// No IO. This corresponds to the implementation of [`EmptyIO`].
    #[default]
    Empty,
    /// A buffered implementation. See [`BufferedIO`].
    Buffered(BufferedIO),
    /// A bi-channel IO implementation. See [`BiChannelIO`].
    BiChannel(BiChannelIO),
    /// A custom IO implementation. See [`CustomIO`].
    Custom(CustomIO)
}
impl std::fmt::Debug for SimIO {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimIO")
            .finish_non_exhaustive()
    }
}
impl From<EmptyIO> for SimIO {
    fn from(_value: EmptyIO) -> Self {
        SimIO::Empty
    }
}
impl From<BufferedIO> for SimIO {
    fn from(value: BufferedIO) -> Self {
        SimIO::Buffered(value)
    }
}
impl From<BiChannelIO> for SimIO {
    fn from(value: BiChannelIO) -> Self {
        SimIO::BiChannel(value)
    }
}
impl From<CustomIO> for SimIO {
    fn from(value: CustomIO) -> Self {
        SimIO::Custom(value)
    }
}
impl CharIO for SimIO {
    fn read_char(&self) -> Option<u8> {
        match self {
            SimIO::Empty         => EmptyIO.read_char(),
            SimIO::Buffered(io)  => io.read_char(),
            SimIO::BiChannel(io) => io.read_char(),
            SimIO::Custom(io)    => io.read_char(),
        }
    }

    fn write_char(&self, stream: Stream, byte: u8) -> bool {
        match self {
            SimIO::Empty         => EmptyIO.write_char(stream, byte),
            SimIO::Buffered(io)  => io.write_char(stream, byte),
            SimIO::BiChannel(io) => io.write_char(stream, byte),
            SimIO::Custom(io)    => io.write_char(stream, byte),
        }
    }

    fn close(&mut self) {
        match self {
            SimIO::Empty         => {},
            SimIO::Buffered(io)  => io.close(),
            SimIO::BiChannel(io) => io.close(),
            SimIO::Custom(io)    => io.close(),
        }
    }
}
