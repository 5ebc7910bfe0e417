//! Framed Unix-socket transport to the authority.

use std::io;
use std::path::Path;

use tokio::net::UnixStream;

use namecert_core::framing::{read_frame, write_frame};
use namecert_core::{Data, Interest};

use crate::request::ClientError;

/// One connection to the authority daemon.
pub struct Transport {
    stream: UnixStream,
}

impl Transport {
    pub async fn connect(socket_path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self { stream })
    }

    /// Express one interest and wait for its data packet. An empty reply
    /// frame means the authority had nothing for the name.
    pub async fn express(&mut self, interest: &Interest) -> Result<Data, ClientError> {
        write_frame(&mut self.stream, &interest.encode())
            .await
            .map_err(|_| ClientError::NoData)?;
        let frame = read_frame(&mut self.stream)
            .await
            .map_err(|_| ClientError::NoData)?;
        if frame.is_empty() {
            return Err(ClientError::NoData);
        }
        Ok(Data::decode(&frame)?)
    }
}
