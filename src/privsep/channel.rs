//! The unprivileged end of the request channel.

use super::message::{PrivRequest, PrivsepError};
use bytes::{Buf, BytesMut};
use std::{io, os::unix::net::UnixStream as StdUnixStream};
use tokio::{
    io::{AsyncWriteExt, Interest},
    net::UnixStream,
};

/// Queues requests and writes them as the socket accepts them.
pub struct PrivChannel {
    stream: UnixStream,
    queue: BytesMut,
}

impl PrivChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            queue: BytesMut::new(),
        }
    }

    /// Must run inside the runtime.
    pub fn from_std(stream: StdUnixStream) -> Result<Self, PrivsepError> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    /// Queues `request`; [`drive`](Self::drive) or [`flush`](Self::flush)
    /// sends it.
    pub fn queue(&mut self, request: &PrivRequest) -> Result<(), PrivsepError> {
        tracing::debug!("Queueing {} request", request.name());
        request.encode(&mut self.queue)
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Writes queued requests as the socket allows and watches for the
    /// other end going away. Returns only on failure. Cancel safe.
    pub async fn drive(&mut self) -> PrivsepError {
        let mut scratch = [0u8; 64];
        loop {
            let interest = if self.queue.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            let ready = match self.stream.ready(interest).await {
                Ok(ready) => ready,
                Err(e) => return e.into(),
            };

            if ready.is_readable() {
                match self.stream.try_read(&mut scratch) {
                    Ok(0) => return PrivsepError::Closed,
                    // The privileged side never writes.
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return e.into(),
                }
            }

            if ready.is_writable() && !self.queue.is_empty() {
                match self.stream.try_write(&self.queue) {
                    Ok(n) => self.queue.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return e.into(),
                }
            }
        }
    }

    /// Writes everything still queued.
    pub async fn flush(&mut self) -> Result<(), PrivsepError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.queue).await?;
        self.queue.clear();
        Ok(())
    }
}
