//! Synchronous remote calls to a host process.
//!
//! Some library calls cannot be serviced inside the emulator process (anything that needs a
//! window server, for instance) and are forwarded to a helper process over a pair of pipes.
//! Each call is strictly request/response:
//!
//! ```text
//! request:  tag (u32, native order) | argument bytes ... | "DONE"
//! response: return value bytes                           | "DONE"
//! ```
//!
//! Only fixed-size plain data crosses the pipe. [`WireValue`] is implemented for integers,
//! floats, `bool`, `()` and arrays of those; pointers, references and guest addresses have no
//! meaning in the other process and do not implement it.
//!
//! A trailer other than `DONE`, or a pipe that closes mid-call, faults the channel for good:
//! the two sides can no longer agree on message boundaries.

use std::{
    ffi::OsStr,
    io::{ErrorKind, Read, Write},
    process::{Child, Command, Stdio},
};

use log::{debug, warn};
use strum::{EnumCount, EnumIter};

use crate::{
    Error::{ChannelUnavailable, ProtocolFault},
    Result,
};

/// Trailer closing every request and response.
pub const SENTINEL: [u8; 4] = *b"DONE";

/// A value that can cross the RPC pipe by copying its bytes.
pub trait WireValue: Sized + Copy {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Append the encoded value to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decode a value from exactly [`WireValue::SIZE`] bytes.
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_wire_value {
    ($($ty:ty),*) => {
        $(
            impl WireValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_ne_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut buffer = [0u8; std::mem::size_of::<$ty>()];
                    buffer.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_ne_bytes(buffer)
                }
            }
        )*
    };
}

impl_wire_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl WireValue for bool {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl WireValue for () {
    const SIZE: usize = 0;

    fn encode(&self, _out: &mut Vec<u8>) {}

    fn decode(_bytes: &[u8]) -> Self {}
}

impl<T: WireValue, const N: usize> WireValue for [T; N] {
    const SIZE: usize = T::SIZE * N;

    fn encode(&self, out: &mut Vec<u8>) {
        for value in self {
            value.encode(out);
        }
    }

    fn decode(bytes: &[u8]) -> Self {
        std::array::from_fn(|index| T::decode(&bytes[index * T::SIZE..]))
    }
}

/// Object-safe view of a [`WireValue`], used for heterogeneous argument lists.
pub trait WireArg {
    /// Append the encoded argument to `out`.
    fn write_wire(&self, out: &mut Vec<u8>);
}

impl<T: WireValue> WireArg for T {
    fn write_wire(&self, out: &mut Vec<u8>) {
        self.encode(out);
    }
}

/// Requests understood by the UI helper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCount)]
#[repr(u32)]
pub enum UiMessage {
    /// Return the next pending event matching a mask without removing it
    PeekNextEvent = 0,
    /// Remove the next pending event matching a mask
    DiscardNextEvent = 1,
    /// Play the system alert sound
    Beep = 2,
    /// Create a window
    CreateWindow = 3,
}

impl UiMessage {
    /// The wire tag of this message.
    #[must_use]
    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// One end of a request/response pipe pair.
pub struct Channel<R: Read, W: Write> {
    reader: R,
    writer: W,
    faulted: bool,
}

impl<R: Read, W: Write> Channel<R, W> {
    /// Wrap a reader for responses and a writer for requests.
    pub fn new(reader: R, writer: W) -> Self {
        Channel {
            reader,
            writer,
            faulted: false,
        }
    }

    /// True once a protocol error has occurred; every further call fails.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// The response side of the channel.
    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// The request side of the channel.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    /// Returns [`crate::Error::ProtocolFault`] if the channel is already faulted, a pipe
    /// fails or closes, or the response trailer is not `DONE`. Any of these leave the
    /// channel faulted.
    pub fn call<T: WireValue>(&mut self, tag: u32, args: &[&dyn WireArg]) -> Result<T> {
        if self.faulted {
            return Err(ProtocolFault(format!(
                "call {tag} on a faulted channel"
            )));
        }

        let mut request = Vec::with_capacity(8 + args.len() * 4);
        request.extend_from_slice(&tag.to_ne_bytes());
        for arg in args {
            arg.write_wire(&mut request);
        }
        request.extend_from_slice(&SENTINEL);

        let result = self.exchange::<T>(&request);
        if let Err(error) = &result {
            self.faulted = true;
            warn!("RPC channel faulted during call {tag}: {error}");
        } else {
            debug!("RPC call {tag} completed");
        }
        result
    }

    fn exchange<T: WireValue>(&mut self, request: &[u8]) -> Result<T> {
        self.writer
            .write_all(request)
            .and_then(|()| self.writer.flush())
            .map_err(|error| ProtocolFault(format!("request failed: {error}")))?;

        let mut response = vec![0u8; T::SIZE + SENTINEL.len()];
        self.reader.read_exact(&mut response).map_err(|error| {
            if error.kind() == ErrorKind::UnexpectedEof {
                ProtocolFault("channel closed before the response completed".to_string())
            } else {
                ProtocolFault(format!("response failed: {error}"))
            }
        })?;

        if response[T::SIZE..] != SENTINEL {
            return Err(ProtocolFault(format!(
                "expected DONE trailer, got {:02X?}",
                &response[T::SIZE..]
            )));
        }

        Ok(T::decode(&response[..T::SIZE]))
    }
}

type BoxedReader = Box<dyn Read + Send + Sync>;
type BoxedWriter = Box<dyn Write + Send + Sync>;

/// A channel to the UI helper.
///
/// The helper is normally a spawned process. Dropping the channel closes both pipes, which
/// the helper takes as its cue to exit, and reaps the child.
pub struct UiChannel {
    channel: Option<Channel<BoxedReader, BoxedWriter>>,
    child: Option<Child>,
}

impl UiChannel {
    /// Start `program` with piped stdin/stdout.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the process cannot be started and
    /// [`crate::Error::ChannelUnavailable`] if its pipes are missing.
    pub fn spawn<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<UiChannel>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            // Best effort; the pipes are already unusable.
            let _ = child.kill();
            let _ = child.wait();
            return Err(ChannelUnavailable);
        };

        debug!("Started UI helper process {}", child.id());
        Ok(UiChannel {
            channel: Some(Channel::new(Box::new(stdout), Box::new(stdin))),
            child: Some(child),
        })
    }

    /// Talk to a helper over already-connected pipes, with no process to manage.
    pub fn from_pipes(
        reader: impl Read + Send + Sync + 'static,
        writer: impl Write + Send + Sync + 'static,
    ) -> UiChannel {
        UiChannel {
            channel: Some(Channel::new(Box::new(reader), Box::new(writer))),
            child: None,
        }
    }

    /// Send a [`UiMessage`] and wait for its response.
    ///
    /// # Errors
    /// See [`Channel::call`].
    pub fn perform<T: WireValue>(&mut self, message: UiMessage, args: &[&dyn WireArg]) -> Result<T> {
        match self.channel.as_mut() {
            Some(channel) => channel.call(message.tag(), args),
            None => Err(ChannelUnavailable),
        }
    }

    /// True once the channel has faulted.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.channel.as_ref().map_or(true, Channel::is_faulted)
    }
}

impl Drop for UiChannel {
    fn drop(&mut self) {
        drop(self.channel.take());
        if let Some(mut child) = self.child.take() {
            if let Err(error) = child.wait() {
                warn!("Failed to reap UI helper process: {error}");
            }
        }
    }
}
