//! Multi-channel example — two logical streams over one socket pair.
//!
//! Run with:
//!   cargo run --example multi-channel

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use fmux::{ChannelType, Connection, IpcStream, CONTROL};

const COMMAND: u32 = 1;
const DATA: u32 = 2;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_target(false)
        .try_init();

    let (left, right) = IpcStream::pair()?;
    let client = Connection::open(left, 8)?;
    let server = Connection::open(right, 8)?;

    let server_thread = thread::spawn(
        move || -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            server.open_channel(COMMAND)?;
            server.open_channel_with_type(DATA, ChannelType::Binary)?;
            let control = server.open_channel(CONTROL)?;

            let mut served = 0;
            let mut buf = [0u8; 256];
            while served < 2 {
                for channel in server.select(Some(Duration::from_secs(5)))? {
                    let n = server.read(&channel, &mut buf)?;
                    let name = match channel.id() {
                        COMMAND => "COMMAND",
                        DATA => "DATA",
                        _ => "UNKNOWN",
                    };
                    eprintln!(
                        "[server] channel={name} payload={}",
                        String::from_utf8_lossy(&buf[..n])
                    );
                    server.write(&channel, &buf[..n])?;
                    served += 1;
                }
            }
            server.write(&control, b"done")?;
            Ok(())
        },
    );

    let mut command = client.stream(client.open_channel(COMMAND)?);
    let mut data = client.stream(client.open_channel_with_type(DATA, ChannelType::Binary)?);
    let mut control = client.stream(client.open_channel(CONTROL)?);
    for stream in [&mut command, &mut data, &mut control] {
        stream.set_read_timeout(Some(Duration::from_secs(5)));
    }

    command.write_all(b"{\"action\":\"ping\"}")?;
    command.flush()?;
    let mut buf = [0u8; 256];
    let n = command.read(&mut buf)?;
    eprintln!("[client] COMMAND response: {}", String::from_utf8_lossy(&buf[..n]));

    data.write_all(b"bulk payload bytes here")?;
    data.flush()?;
    let n = data.read(&mut buf)?;
    eprintln!("[client] DATA response: {}", String::from_utf8_lossy(&buf[..n]));

    let n = control.read(&mut buf)?;
    eprintln!("[client] CONTROL: {}", String::from_utf8_lossy(&buf[..n]));

    server_thread
        .join()
        .expect("server thread should not panic")
        .map_err(|err| err.to_string())?;
    client.close();
    Ok(())
}
