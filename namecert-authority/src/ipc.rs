//! Framed Unix-socket front end.
//!
//! One interest per frame in, one data packet per frame out. An empty
//! reply frame means the interest matched nothing; the transport treats
//! it like silence.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};

use namecert_core::framing::{read_frame, write_frame};
use namecert_core::Interest;

use crate::service::CaService;

/// Accept loop. Runs until the listener errors or the task is dropped.
pub async fn serve(socket_path: &Path, service: Arc<CaService>) -> io::Result<()> {
    // Stale sockets from a previous life would fail the bind.
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(path = %socket_path.display(), "authority listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, service).await {
                tracing::debug!(%error, "connection ended");
            }
        });
    }
}

async fn handle_connection(mut stream: UnixStream, service: Arc<CaService>) -> io::Result<()> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(error) => return Err(error),
        };
        let reply = match Interest::decode(&frame) {
            Ok(interest) => service
                .handle_interest(&interest)
                .await
                .map(|data| data.encode()),
            Err(error) => {
                tracing::warn!(%error, "dropping undecodable interest frame");
                None
            }
        };
        match reply {
            Some(wire) => write_frame(&mut stream, &wire).await?,
            None => write_frame(&mut stream, &[]).await?,
        }
    }
}
