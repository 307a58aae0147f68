//! Stream data transfer
//!
//! Byte-level send/receive on a native stream with the interpreter
//! released. A native return of -2 means the stream is non-blocking and
//! not ready; it is reported as its own outcome rather than an error.

use std::os::raw::c_int;

use crate::error::{BridgeError, Result};
use crate::host::{allow_threads, Interpreter};

/// Native return code for a non-blocking stream that is not ready
pub const STREAM_WOULD_BLOCK: c_int = -2;

/// Native stream I/O
pub trait StreamIo: Send + Sync {
    fn send(&self, data: &[u8]) -> c_int;
    fn recv(&self, buf: &mut [u8]) -> c_int;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Received bytes; empty at end of stream
    Data(Vec<u8>),
    WouldBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(usize),
    WouldBlock,
}

/// Receive up to `nbytes` bytes
pub fn stream_recv(
    stream: &dyn StreamIo,
    nbytes: usize,
    interpreter: &dyn Interpreter,
) -> Result<RecvOutcome> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(nbytes)?;
    buf.resize(nbytes, 0);

    let rc = allow_threads(interpreter, || stream.recv(&mut buf));
    match rc {
        STREAM_WOULD_BLOCK => Ok(RecvOutcome::WouldBlock),
        rc if rc < 0 => Err(BridgeError::native("virStreamRecv", rc)),
        rc => {
            buf.truncate(rc as usize);
            Ok(RecvOutcome::Data(buf))
        }
    }
}

/// Send `data`, returning how many bytes the native side accepted
pub fn stream_send(
    stream: &dyn StreamIo,
    data: &[u8],
    interpreter: &dyn Interpreter,
) -> Result<SendOutcome> {
    let rc = allow_threads(interpreter, || stream.send(data));
    match rc {
        STREAM_WOULD_BLOCK => Ok(SendOutcome::WouldBlock),
        rc if rc < 0 => Err(BridgeError::native("virStreamSend", rc)),
        rc => Ok(SendOutcome::Sent(rc as usize)),
    }
}
