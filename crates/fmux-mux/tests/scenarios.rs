#![cfg(unix)]

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fmux_frame::{read_frame, write_frame, Frame, DEFAULT_MAX_PAYLOAD};
use fmux_mux::{
    Connection, Mode, MuxConfig, MuxError, Pump, PumpError, CONTROL, RECOMMENDED_CHANNELS,
};
use fmux_transport::{wait_readable, IpcStream};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn spawn_pump() -> (Arc<Pump>, JoinHandle<Result<(), PumpError>>) {
    let pump = Arc::new(Pump::new().expect("pump should be created"));
    let runner = Arc::clone(&pump);
    let handle = thread::spawn(move || runner.start());
    assert!(
        pump.wait_until_running(Duration::from_secs(5)),
        "pump should start"
    );
    (pump, handle)
}

fn shutdown(pump: &Pump, handle: JoinHandle<Result<(), PumpError>>) {
    pump.stop().expect("pump should stop");
    handle
        .join()
        .expect("pump thread should not panic")
        .expect("pump loop should exit cleanly");
}

#[test]
fn hello_goes_out_as_thirteen_bytes() {
    init_logging();
    let (mut wire, writer) = IpcStream::pipe().expect("pipe should be created");
    let conn = Connection::open(writer, RECOMMENDED_CHANNELS).expect("connection should open");
    let ch = conn.open_channel(1).expect("channel 1 should open");

    assert_eq!(conn.write(&ch, b"Hello").expect("write should succeed"), 5);

    let mut bytes = [0u8; 13];
    wire.read_exact(&mut bytes).expect("frame should be on the wire");
    assert_eq!(
        bytes,
        [0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F]
    );
    assert!(
        !wait_readable(wire.as_raw_fd(), Some(Duration::ZERO)).expect("poll should succeed"),
        "nothing follows the frame"
    );
}

#[test]
fn successive_frames_are_read_in_turn() {
    init_logging();
    let (reader, mut wire) = IpcStream::pipe().expect("pipe should be created");
    let conn = Connection::open(reader, RECOMMENDED_CHANNELS).expect("connection should open");
    let ch = conn.open_channel(1).expect("channel 1 should open");

    wire.write_all(&[0, 0, 0, 1, 0, 0, 0, 5])
        .and_then(|()| wire.write_all(b"Hello"))
        .expect("frame should be written");

    let mut buf = [0u8; 32];
    let n = conn.read(&ch, &mut buf).expect("read should succeed");
    assert_eq!(&buf[..n], b"Hello");

    write_frame(&mut wire, 1, b"Goodbye").expect("frame should be written");
    let n = conn.read(&ch, &mut buf).expect("read should succeed");
    assert_eq!(&buf[..n], b"Goodbye");
}

#[test]
fn select_reports_channels_with_queued_frames() {
    init_logging();
    let (local, mut remote) = IpcStream::pair().expect("socket pair should be created");
    let conn = Connection::open(local, RECOMMENDED_CHANNELS).expect("connection should open");

    // Queued in the transport before either channel exists.
    write_frame(&mut remote, 1, b"first").expect("frame should be written");
    write_frame(&mut remote, 2, b"second").expect("frame should be written");

    let one = conn.open_channel(1).expect("channel 1 should open");
    let two = conn.open_channel(2).expect("channel 2 should open");

    let ready = conn
        .select(Some(Duration::ZERO))
        .expect("select should succeed");
    assert_eq!(ready, vec![one, two]);

    let mut buf = [0u8; 16];
    let n = conn.read(&one, &mut buf).expect("read should succeed");
    assert_eq!(&buf[..n], b"first");
    let n = conn.read(&two, &mut buf).expect("read should succeed");
    assert_eq!(&buf[..n], b"second");
}

#[test]
fn one_pump_services_two_connections() {
    init_logging();
    let (pump, handle) = spawn_pump();

    let (local_a, mut remote_a) = IpcStream::pair().expect("socket pair should be created");
    let (local_b, mut remote_b) = IpcStream::pair().expect("socket pair should be created");
    let a = Connection::open(local_a, RECOMMENDED_CHANNELS).expect("connection should open");
    let b = Connection::open(local_b, RECOMMENDED_CHANNELS).expect("connection should open");
    pump.add(&a).expect("first connection should be added");
    pump.add(&b).expect("second connection should be added");
    assert_eq!(pump.len(), 2);

    write_frame(&mut remote_a, CONTROL, b"to a").expect("frame should be written");
    write_frame(&mut remote_b, CONTROL, b"to b").expect("frame should be written");

    let control_a = a.open_channel(CONTROL).expect("control channel is open");
    let control_b = b.open_channel(CONTROL).expect("control channel is open");

    let mut buf = [0u8; 8];
    let n = a
        .read_timeout(&control_a, &mut buf, WAIT)
        .expect("pump should deliver to a");
    assert_eq!(&buf[..n], b"to a");
    let n = b
        .read_timeout(&control_b, &mut buf, WAIT)
        .expect("pump should deliver to b");
    assert_eq!(&buf[..n], b"to b");

    shutdown(&pump, handle);
    assert_eq!(a.mode(), Mode::Synchronous);
    assert_eq!(b.mode(), Mode::Synchronous);
}

#[test]
fn pumped_connection_is_never_double_serviced() {
    init_logging();
    let (first, first_handle) = spawn_pump();
    let (second, second_handle) = spawn_pump();

    let (local, mut remote) = IpcStream::pair().expect("socket pair should be created");
    let conn = Connection::open(local, RECOMMENDED_CHANNELS).expect("connection should open");
    let ch = conn.open_channel(3).expect("channel 3 should open");

    first.add(&conn).expect("first pump should take the connection");
    assert!(matches!(second.add(&conn), Err(PumpError::AlreadyPumped)));
    assert!(matches!(conn.flush_reads(), Err(MuxError::Pumped)));

    assert!(first.remove(&conn).expect("remove should succeed"));
    assert_eq!(conn.mode(), Mode::Synchronous);

    write_frame(&mut remote, 3, b"sync again").expect("frame should be written");
    let mut buf = [0u8; 16];
    let n = conn
        .read_timeout(&ch, &mut buf, WAIT)
        .expect("synchronous read should work after remove");
    assert_eq!(&buf[..n], b"sync again");

    shutdown(&first, first_handle);
    shutdown(&second, second_handle);
}

#[test]
fn frames_for_unopened_channels_vanish() {
    init_logging();
    let (local, mut remote) = IpcStream::pair().expect("socket pair should be created");
    let conn = Connection::open(local, 8).expect("connection should open");
    let ch = conn.open_channel(1).expect("channel 1 should open");

    write_frame(&mut remote, 5, b"nobody home").expect("frame should be written");
    write_frame(&mut remote, 1, b"delivered").expect("frame should be written");

    let mut buf = [0u8; 32];
    let n = conn.read(&ch, &mut buf).expect("read should succeed");
    assert_eq!(&buf[..n], b"delivered");

    // Opening channel 5 afterwards does not resurrect the dropped frame.
    let late = conn.open_channel(5).expect("channel 5 should open");
    assert_eq!(conn.try_read(&late, &mut buf).expect("try_read should succeed"), None);
}

#[test]
fn closed_channel_stays_closed() {
    init_logging();
    let (local, _remote) = IpcStream::pair().expect("socket pair should be created");
    let conn = Connection::open(local, 8).expect("connection should open");
    let ch = conn.open_channel(4).expect("channel 4 should open");
    conn.close_channel(4).expect("close should succeed");

    assert!(matches!(
        conn.write(&ch, b"ghost"),
        Err(MuxError::InvalidChannel { id: 4 })
    ));
    assert!(!conn.is_open(&ch));

    let reopened = conn.open_channel(4).expect("channel 4 should reopen");
    assert_ne!(reopened, ch);
    assert!(matches!(
        conn.write(&ch, b"ghost"),
        Err(MuxError::InvalidChannel { id: 4 })
    ));
}

#[test]
fn order_is_preserved_across_chunks_and_channels() {
    init_logging();
    let (left, right) = IpcStream::pair().expect("socket pair should be created");
    let config = MuxConfig {
        chunk_size: 100,
        outbound_capacity: 1000,
        ..MuxConfig::with_channels(4)
    };
    let sender = Connection::with_config(left, config.clone()).expect("connection should open");
    let receiver = Connection::with_config(right, config).expect("connection should open");

    let payload_a: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let payload_b: Vec<u8> = (0..3000u32).map(|i| (i % 199) as u8).collect();

    let out_a = sender.open_channel(1).expect("channel should open");
    let out_b = sender.open_channel(2).expect("channel should open");
    let in_a = receiver.open_channel(1).expect("channel should open");
    let in_b = receiver.open_channel(2).expect("channel should open");

    let reader = {
        let receiver = receiver.clone();
        let (len_a, len_b) = (payload_a.len(), payload_b.len());
        thread::spawn(move || {
            let mut got_a = Vec::new();
            let mut got_b = Vec::new();
            let mut buf = [0u8; 512];
            while got_a.len() < len_a || got_b.len() < len_b {
                for channel in receiver.select(WAIT).expect("select should succeed") {
                    let n = receiver
                        .read(&channel, &mut buf)
                        .expect("read should succeed");
                    if channel == in_a {
                        got_a.extend_from_slice(&buf[..n]);
                    } else if channel == in_b {
                        got_b.extend_from_slice(&buf[..n]);
                    }
                }
            }
            (got_a, got_b)
        })
    };

    let mut stream_a = sender.stream(out_a);
    let mut stream_b = sender.stream(out_b);
    for (chunk_a, chunk_b) in payload_a.chunks(700).zip(payload_b.chunks(700)) {
        stream_a.write_all(chunk_a).expect("write should succeed");
        stream_b.write_all(chunk_b).expect("write should succeed");
    }
    for chunk_a in payload_a.chunks(700).skip(payload_b.chunks(700).count()) {
        stream_a.write_all(chunk_a).expect("write should succeed");
    }
    stream_a.flush().expect("flush should succeed");
    stream_b.flush().expect("flush should succeed");

    let (got_a, got_b) = reader.join().expect("reader should not panic");
    assert_eq!(got_a, payload_a);
    assert_eq!(got_b, payload_b);
}

#[test]
fn concurrent_writers_share_one_transport() {
    init_logging();
    let (pump, handle) = spawn_pump();
    let (left, right) = IpcStream::pair().expect("socket pair should be created");
    let sender = Connection::open(left, 8).expect("connection should open");
    let receiver = Connection::open(right, 8).expect("connection should open");
    pump.add(&receiver).expect("receiver should be pumped");

    let writers: Vec<_> = (1..=4u32)
        .map(|id| {
            let sender = sender.clone();
            receiver.open_channel(id).expect("channel should open");
            thread::spawn(move || {
                let ch = sender.open_channel(id).expect("channel should open");
                let mut stream = sender.stream(ch);
                for i in 0..200u32 {
                    stream
                        .write_all(format!("{id}:{i};").as_bytes())
                        .expect("write should succeed");
                }
                stream.flush().expect("flush should succeed");
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer should not panic");
    }

    for id in 1..=4u32 {
        let ch = receiver.open_channel(id).expect("channel is open");
        let expected: String = (0..200u32).map(|i| format!("{id}:{i};")).collect();
        let mut stream = receiver.stream(ch);
        stream.set_read_timeout(WAIT);

        let mut got = vec![0u8; expected.len()];
        stream.read_exact(&mut got).expect("all bytes should arrive");
        assert_eq!(String::from_utf8(got).expect("utf-8"), expected);
    }

    shutdown(&pump, handle);
}

#[test]
fn remote_hangup_ends_every_channel() {
    init_logging();
    let (local, mut remote) = IpcStream::pair().expect("socket pair should be created");
    let conn = Connection::open(local, 4).expect("connection should open");
    let ch = conn.open_channel(2).expect("channel should open");

    write_frame(&mut remote, 2, b"bye").expect("frame should be written");
    drop(remote);

    let mut buf = [0u8; 8];
    let n = conn.read(&ch, &mut buf).expect("read should succeed");
    assert_eq!(&buf[..n], b"bye");
    assert_eq!(conn.read(&ch, &mut buf).expect("read should succeed"), 0);
    assert!(conn.is_eof());

    // A peer reading our side still sees well-formed frames.
    let (local, mut remote) = IpcStream::pair().expect("socket pair should be created");
    let conn = Connection::open(local, 4).expect("connection should open");
    let control = conn.open_channel(CONTROL).expect("control channel is open");
    conn.write(&control, b"ping").expect("write should succeed");
    let frame = read_frame(&mut remote, DEFAULT_MAX_PAYLOAD)
        .expect("frame should decode")
        .expect("frame should be present");
    assert_eq!(frame.channel, CONTROL);
    assert_eq!(frame.payload.as_ref(), b"ping");
}

#[test]
fn closed_channel_drops_later_frames() {
    init_logging();
    let (local, mut remote) = IpcStream::pair().expect("socket pair should be created");
    let conn = Connection::open(local, RECOMMENDED_CHANNELS).expect("connection should open");
    let ch = conn.open_channel(1).expect("channel 1 should open");

    write_frame(&mut remote, 1, b"Hello").expect("frame should be written");
    let mut buf = [0u8; 16];
    let n = conn.read(&ch, &mut buf).expect("read should succeed");
    assert_eq!(&buf[..n], b"Hello");

    conn.close_channel(1).expect("close should succeed");
    write_frame(&mut remote, 1, b"Goodbye").expect("frame should be written");

    let ready = conn
        .select(Some(Duration::ZERO))
        .expect("select should succeed");
    assert!(ready.iter().all(|channel| channel.id() != 1));
    assert!(matches!(
        conn.read(&ch, &mut buf),
        Err(MuxError::InvalidChannel { id: 1 })
    ));
}

#[test]
fn half_sent_frame_does_not_stall_the_pump() {
    init_logging();
    let (pump, handle) = spawn_pump();

    let (local_a, mut remote_a) = IpcStream::pair().expect("socket pair should be created");
    let (local_b, mut remote_b) = IpcStream::pair().expect("socket pair should be created");
    let a = Connection::open(local_a, RECOMMENDED_CHANNELS).expect("connection should open");
    let b = Connection::open(local_b, RECOMMENDED_CHANNELS).expect("connection should open");
    pump.add(&a).expect("first connection should be added");
    pump.add(&b).expect("second connection should be added");

    // Header only: the payload of a's frame has not been sent yet.
    remote_a
        .write_all(&[0, 0, 0, 0, 0, 0, 0, 4])
        .expect("header should be written");
    write_frame(&mut remote_b, CONTROL, b"to b").expect("frame should be written");

    let control_b = b.open_channel(CONTROL).expect("control channel is open");
    let mut buf = [0u8; 8];
    let n = b
        .read_timeout(&control_b, &mut buf, WAIT)
        .expect("pump should deliver to b");
    assert_eq!(&buf[..n], b"to b");

    let started = Instant::now();
    a.open_channel(3).expect("channel 3 should open");
    assert!(started.elapsed() < Duration::from_secs(1));

    // The rest of the frame trickles in a byte at a time.
    for byte in b"to a" {
        remote_a.write_all(&[*byte]).expect("payload byte should be written");
        thread::sleep(Duration::from_millis(5));
    }
    let control_a = a.open_channel(CONTROL).expect("control channel is open");
    let n = a
        .read_timeout(&control_a, &mut buf, WAIT)
        .expect("pump should deliver to a");
    assert_eq!(&buf[..n], b"to a");

    shutdown(&pump, handle);
}

#[test]
fn unread_control_channel_holds_back_other_channels() {
    init_logging();
    let (local, mut remote) = IpcStream::pair().expect("socket pair should be created");
    let config = MuxConfig {
        inbound_high_water: 1024,
        ..MuxConfig::with_channels(4)
    };
    let conn = Connection::with_config(local, config).expect("connection should open");
    let control = conn.open_channel(CONTROL).expect("control channel is open");
    let data = conn.open_channel(1).expect("channel 1 should open");

    write_frame(&mut remote, CONTROL, &[7u8; 2048]).expect("frame should be written");
    write_frame(&mut remote, 1, b"behind").expect("frame should be written");

    let mut buf = [0u8; 4096];
    assert!(matches!(
        conn.read_timeout(&data, &mut buf, Some(Duration::from_millis(50))),
        Err(MuxError::TimedOut(_))
    ));

    assert_eq!(conn.read(&control, &mut buf).expect("read should succeed"), 2048);
    let n = conn
        .read_timeout(&data, &mut buf, WAIT)
        .expect("channel 1 should be delivered once control is drained");
    assert_eq!(&buf[..n], b"behind");
}

#[test]
fn raw_frames_bypass_the_channel_table() {
    init_logging();
    let (left, right) = IpcStream::pair().expect("socket pair should be created");
    let sender = Connection::open(left, 4).expect("connection should open");
    let receiver = Connection::open(right, 4).expect("connection should open");

    sender
        .push(&Frame::new(2, &b"unopened on both ends"[..]))
        .expect("push should succeed");

    let deadline = Instant::now() + Duration::from_secs(5);
    let frame = loop {
        if let Some(frame) = receiver.pop().expect("pop should succeed") {
            break frame;
        }
        assert!(Instant::now() < deadline, "pushed frame should arrive");
        thread::sleep(Duration::from_millis(5));
    };
    assert_eq!(frame, Frame::new(2, &b"unopened on both ends"[..]));
}
