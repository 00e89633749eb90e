//! Async example — the same wire format through `tokio_util::codec`.
//!
//! A synchronous fmux connection on one end of a socket pair talks to a tokio
//! task that reads and writes raw frames with `MuxCodec`.
//!
//! Run with:
//!   cargo run --example async-frames --features async

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use fmux::frame::{Frame, MuxCodec};
use fmux::Connection;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_target(false)
        .try_init();

    let (left, right) = std::os::unix::net::UnixStream::pair()?;
    right.set_nonblocking(true)?;
    let conn = Connection::open(left, 4)?;
    let mut framed = Framed::new(tokio::net::UnixStream::from_std(right)?, MuxCodec::default());

    let blocking = tokio::task::spawn_blocking(move || -> Result<String, fmux::MuxError> {
        let ch = conn.open_channel(3)?;
        conn.write(&ch, b"hello from the sync side")?;

        let mut buf = [0u8; 64];
        let n = conn.read_timeout(&ch, &mut buf, Some(Duration::from_secs(5)))?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    });

    let frame = framed.next().await.ok_or("stream ended early")??;
    eprintln!(
        "[async] channel={} payload={}",
        frame.channel,
        String::from_utf8_lossy(&frame.payload)
    );
    framed
        .send(Frame::new(frame.channel, &b"hello from tokio"[..]))
        .await?;

    let reply = blocking.await??;
    eprintln!("[sync] got: {reply}");
    Ok(())
}
