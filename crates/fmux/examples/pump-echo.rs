//! Pump example — one background loop serving several echo connections.
//!
//! Each "client" talks to its own server-side connection; a single pump
//! thread demultiplexes all of the server side.
//!
//! Run with:
//!   cargo run --example pump-echo

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fmux::{Connection, IpcStream, Pump};

const CLIENTS: usize = 3;
const ECHO: u32 = 1;
const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_target(false)
        .try_init();

    let pump = Arc::new(Pump::new()?);
    let runner = Arc::clone(&pump);
    let pump_thread = thread::spawn(move || runner.start());
    if !pump.wait_until_running(Duration::from_secs(1)) {
        return Err("pump did not start".into());
    }

    let mut clients = Vec::new();
    let mut servers = Vec::new();
    for _ in 0..CLIENTS {
        let (left, right) = IpcStream::pair()?;
        let client = Connection::open(left, 4)?;
        let server = Connection::open(right, 4)?;
        server.open_channel(ECHO)?;
        pump.add(&server)?;
        clients.push(client);
        servers.push(server);
    }
    eprintln!("[pump] serving {} connections", pump.len());

    for (i, client) in clients.iter().enumerate() {
        let ch = client.open_channel(ECHO)?;
        client.write(&ch, format!("hello from client {i}").as_bytes())?;
    }

    // Server side: reads only drain what the pump already routed.
    let mut buf = [0u8; 128];
    for server in &servers {
        let ch = server.open_channel(ECHO)?;
        let n = server.read_timeout(&ch, &mut buf, WAIT)?;
        server.write(&ch, &buf[..n])?;
    }

    for (i, client) in clients.iter().enumerate() {
        let ch = client.open_channel(ECHO)?;
        let n = client.read_timeout(&ch, &mut buf, WAIT)?;
        eprintln!("[client {i}] echoed: {}", String::from_utf8_lossy(&buf[..n]));
    }

    pump.stop()?;
    pump_thread.join().expect("pump thread should not panic")?;
    Ok(())
}
