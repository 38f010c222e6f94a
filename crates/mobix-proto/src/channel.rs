//! Byte channels carrying agents and class definitions
//!
//! A transfer arrives on up to two channels: channel 0 holds the serialized
//! agent, channel 1 the class bytes or archive. Each channel carries exactly
//! one unit and the unit is only handed out once the sender has finished it.

use crate::ProtocolError;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum unit size (16MB)
pub const MAX_UNIT_SIZE: usize = 16 * 1024 * 1024;

/// A single-unit byte channel
pub struct DataChannel {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    max_unit_size: usize,
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("max_unit_size", &self.max_unit_size)
            .finish()
    }
}

impl DataChannel {
    /// Wrap an async byte source
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            max_unit_size: MAX_UNIT_SIZE,
        }
    }

    /// Channel over bytes that are already complete
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(std::io::Cursor::new(bytes.into()))
    }

    /// Override the maximum accepted unit size
    pub fn with_max_unit_size(mut self, max_unit_size: usize) -> Self {
        self.max_unit_size = max_unit_size;
        self
    }

    /// Read the whole unit, waiting for the sender to close the channel.
    ///
    /// Nothing is returned before end-of-stream, so callers never interpret a
    /// partial unit. With `timeout` set to `None` a stalled sender blocks the
    /// caller forever.
    pub async fn read_unit(mut self, timeout: Option<Duration>) -> Result<Bytes, ProtocolError> {
        let max = self.max_unit_size;
        let read = async move {
            let mut buf = BytesMut::with_capacity(8192);
            loop {
                let mut temp_buf = [0u8; 8192];
                let n = self.reader.read(&mut temp_buf).await?;
                if n == 0 {
                    return Ok(buf.freeze());
                }
                if buf.len() + n > max {
                    return Err(ProtocolError::UnitTooLarge { max });
                }
                buf.extend_from_slice(&temp_buf[..n]);
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| ProtocolError::ChannelTimeout(limit))?,
            None => read.await,
        }
    }
}

/// The data channels attached to one service call
#[derive(Debug, Default)]
pub struct ChannelSet {
    channels: Vec<Option<DataChannel>>,
}

impl ChannelSet {
    /// No channels attached
    pub fn empty() -> Self {
        Self::default()
    }

    /// Attach `channel` at `index`
    pub fn with_channel(mut self, index: usize, channel: DataChannel) -> Self {
        if self.channels.len() <= index {
            self.channels.resize_with(index + 1, || None);
        }
        self.channels[index] = Some(channel);
        self
    }

    /// Take ownership of the channel at `index`
    pub fn take(&mut self, index: usize) -> Option<DataChannel> {
        self.channels.get_mut(index).and_then(Option::take)
    }

    /// Whether a channel is attached at `index`
    pub fn has(&self, index: usize) -> bool {
        matches!(self.channels.get(index), Some(Some(_)))
    }
}
