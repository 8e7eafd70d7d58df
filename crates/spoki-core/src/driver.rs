//! C2 — Scamper Driver.
//!
//! Owns one connection to a Scamper daemon on a dedicated OS thread, running
//! its own readiness loop instead of sharing a runtime with anything else.
//! Five descriptors are multiplexed on one `polling::Poller`: the daemon
//! socket (read always armed, write armed only while there's something to
//! send and credit to send it with), a wake pipe (read always armed, used
//! for cancellation and for waking the loop when the ingress queue gains
//! work), and a decode pipe pair that carries uudecoded bytes from the
//! control-protocol reader to the object framer.
//!
//! This mirrors `scamper/driver.cpp`'s kqueue loop with `polling` standing
//! in for the OS-specific readiness facility it picked at compile time —
//! the spec only requires "one of kqueue/epoll/poll", not a specific one.

use crate::codec::{decode_object, make_command, parse_control_line, uudecode_line, PingReply, ScamperLine};
use crate::error::ErrorKind;
use crate::metrics::DriverMetrics;
use crate::request::ProbeRequest;
use crossbeam_channel::{Receiver, Sender};
use polling::{Event, Events, PollMode, Poller};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;

pub enum DriverMsg {
    Submit(ProbeRequest),
    Shutdown,
}

const KEY_DAEMON: usize = 1;
const KEY_WAKE: usize = 2;
const KEY_DECODE_READ: usize = 3;
const KEY_DECODE_WRITE: usize = 4;

struct QueuedCommand {
    line: String,
    written: usize,
}

/// Handle to a running driver: send requests in, get replies out, ask it to
/// stop. The driver thread itself owns everything else.
pub struct DriverHandle {
    pub ingress: Sender<DriverMsg>,
    wake_w: RawFd,
    join: Option<std::thread::JoinHandle<()>>,
}

impl DriverHandle {
    pub fn shutdown(&mut self) {
        let _ = self.ingress.send(DriverMsg::Shutdown);
        unsafe {
            let byte = [1u8];
            libc::write(self.wake_w, byte.as_ptr() as *const _, 1);
        }
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Spawn the driver thread. `endpoint` is a `host:port` TCP address — the
/// daemon is expected to be listening there for the control protocol (§6).
pub fn spawn(
    endpoint: String,
    reply_tx: Sender<PingReply>,
    udp_default_payload_hex: String,
    metrics: Arc<DriverMetrics>,
) -> anyhow::Result<(DriverHandle, Receiver<DriverMsg>)> {
    let (ingress_tx, ingress_rx) = crossbeam_channel::unbounded();
    let (wake_r, wake_w) = make_pipe()?;

    let stream = TcpStream::connect(&endpoint).map_err(|e| {
        tracing::error!(
            error = %e,
            %endpoint,
            kind = %ErrorKind::StartupFatal.as_str(),
            "failed to connect to scamper daemon"
        );
        e
    })?;
    stream.set_nonblocking(true)?;
    let daemon_fd = stream.as_raw_fd();

    let (decode_r, decode_w) = make_pipe()?;

    let handle_ingress_rx = ingress_rx.clone();
    let wake_w_for_thread = wake_w;
    let join = std::thread::Builder::new()
        .name("spoki-scamper-driver".into())
        .spawn(move || {
            if let Err(e) = run_loop(
                stream,
                daemon_fd,
                wake_r,
                wake_w_for_thread,
                decode_r,
                decode_w,
                handle_ingress_rx,
                reply_tx,
                udp_default_payload_hex,
                metrics,
            ) {
                tracing::error!(error = %e, kind = %ErrorKind::TransientIo.as_str(), "scamper driver loop exited with error");
            }
        })?;

    Ok((
        DriverHandle {
            ingress: ingress_tx,
            wake_w,
            join: Some(join),
        },
        ingress_rx,
    ))
}

fn make_pipe() -> anyhow::Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        anyhow::bail!("pipe() failed: {}", std::io::Error::last_os_error());
    }
    unsafe {
        let _ = libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK);
        let _ = libc::fcntl(fds[1], libc::F_SETFL, libc::O_NONBLOCK);
    }
    Ok((fds[0], fds[1]))
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    mut stream: TcpStream,
    daemon_fd: RawFd,
    wake_r: RawFd,
    wake_w: RawFd,
    decode_r: RawFd,
    decode_w: RawFd,
    ingress: Receiver<DriverMsg>,
    reply_tx: Sender<PingReply>,
    udp_default_payload_hex: String,
    metrics: Arc<DriverMetrics>,
) -> anyhow::Result<()> {
    let poller = Poller::new()?;
    unsafe {
        poller.add_with_mode(daemon_fd, Event::readable(KEY_DAEMON), PollMode::Level)?;
        poller.add_with_mode(wake_r, Event::readable(KEY_WAKE), PollMode::Level)?;
        poller.add_with_mode(decode_r, Event::readable(KEY_DECODE_READ), PollMode::Level)?;
    }

    // One unit of pre-allocated credit for the attach handshake (§6).
    let mut more: i64 = 0;
    let mut done = false;
    let mut write_queue: VecDeque<QueuedCommand> = VecDeque::new();
    let mut read_buf = [0u8; 65536];
    let mut line_residue: Vec<u8> = Vec::new();
    let mut expected_data_bytes: usize = 0;
    let mut decode_pending: VecDeque<u8> = Vec::new();
    let mut decode_in_buf: Vec<u8> = Vec::new();
    let mut decode_write_armed = false;

    write_queue.push_back(QueuedCommand {
        line: "attach\n".to_string(),
        written: 0,
    });
    more += 1;

    let mut events = Events::new();

    while !done {
        let daemon_write_wanted = more > 0 && !write_queue.is_empty();
        rearm_daemon(&poller, daemon_fd, daemon_write_wanted)?;
        if decode_write_armed != !decode_pending.is_empty() {
            decode_write_armed = !decode_pending.is_empty();
            rearm_decode_write(&poller, decode_w, decode_write_armed)?;
        }
        metrics.queue_depth.store(write_queue.len(), Relaxed);
        metrics.credit.store(more, Relaxed);

        events.clear();
        poller.wait(&mut events, Some(Duration::from_millis(200)))?;

        for ev in events.iter() {
            match ev.key {
                KEY_WAKE => {
                    drain_wake(wake_r);
                    for msg in ingress.try_iter() {
                        match msg {
                            DriverMsg::Submit(req) => {
                                let line = make_command(&req, &udp_default_payload_hex);
                                write_queue.push_back(QueuedCommand { line, written: 0 });
                            }
                            DriverMsg::Shutdown => {
                                done = true;
                            }
                        }
                    }
                }
                KEY_DAEMON => {
                    if ev.readable {
                        read_daemon(
                            &mut stream,
                            &mut read_buf,
                            &mut line_residue,
                            &mut expected_data_bytes,
                            &mut more,
                            &mut decode_pending,
                            &metrics,
                        )?;
                    }
                    if ev.writable && more > 0 {
                        write_daemon(&mut stream, &mut write_queue, &mut more, &metrics)?;
                    }
                }
                KEY_DECODE_WRITE => {
                    if ev.writable {
                        flush_decode_pending(decode_w, &mut decode_pending);
                    }
                }
                KEY_DECODE_READ => {
                    if ev.readable {
                        read_decoded_objects(decode_r, &mut decode_in_buf, &reply_tx, &metrics);
                    }
                }
                _ => {}
            }
        }
    }

    close_all(&[daemon_fd, wake_r, wake_w, decode_r, decode_w]);
    Ok(())
}

fn rearm_daemon(poller: &Poller, fd: RawFd, want_write: bool) -> anyhow::Result<()> {
    let ev = Event {
        key: KEY_DAEMON,
        readable: true,
        writable: want_write,
    };
    poller.modify_with_mode(fd, ev, PollMode::Level)?;
    Ok(())
}

fn rearm_decode_write(poller: &Poller, fd: RawFd, want_write: bool) -> anyhow::Result<()> {
    if want_write {
        unsafe { poller.add_with_mode(fd, Event::writable(KEY_DECODE_WRITE), PollMode::Level)? };
    } else {
        let _ = poller.delete(fd);
    }
    Ok(())
}

fn drain_wake(wake_r: RawFd) {
    let mut buf = [0u8; 256];
    loop {
        let n = unsafe { libc::read(wake_r, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

/// Read available bytes, split on `\n`, dispatch each complete line to
/// either control-line handling or binary-data accumulation depending on
/// whether we're mid-`DATA` frame. Mirrors `handle_scamper_read`.
fn read_daemon(
    stream: &mut TcpStream,
    buf: &mut [u8],
    residue: &mut Vec<u8>,
    expected_data_bytes: &mut usize,
    more: &mut i64,
    decode_pending: &mut VecDeque<u8>,
    metrics: &Arc<DriverMetrics>,
) -> anyhow::Result<()> {
    loop {
        match stream.read(buf) {
            Ok(0) => break,
            Ok(n) => residue.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    loop {
        let Some(pos) = residue.iter().position(|&b| b == b'\n') else {
            break;
        };
        let line_bytes: Vec<u8> = residue.drain(..=pos).collect();
        let consumed = line_bytes.len();
        let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).to_string();

        if *expected_data_bytes > 0 {
            match uudecode_line(&line) {
                Ok(decoded) => decode_pending.extend(decoded),
                Err(e) => {
                    tracing::warn!(error = %e, kind = %ErrorKind::DecodeFailure.as_str(), "uudecode failed, dropping line");
                    metrics.decode_failures.fetch_add(1, Relaxed);
                }
            }
            *expected_data_bytes = expected_data_bytes.saturating_sub(consumed);
        } else {
            match parse_control_line(&line) {
                ScamperLine::Ok => {}
                ScamperLine::More => {
                    *more += 1;
                }
                ScamperLine::Data(n) => {
                    *expected_data_bytes += n;
                }
                ScamperLine::Err(msg) => {
                    tracing::warn!(%msg, kind = %ErrorKind::ProtocolViolation.as_str(), "scamper daemon reported an error");
                    metrics.protocol_violations.fetch_add(1, Relaxed);
                }
                ScamperLine::Unknown(msg) => {
                    tracing::warn!(%msg, kind = %ErrorKind::ProtocolViolation.as_str(), "unrecognized scamper control line");
                    metrics.protocol_violations.fetch_add(1, Relaxed);
                }
            }
        }
    }
    Ok(())
}

/// Write as much of the queue head as the socket accepts. Credit is
/// decremented only once a full command line has been written; partial
/// writes keep the head in place with its offset advanced.
fn write_daemon(
    stream: &mut TcpStream,
    queue: &mut VecDeque<QueuedCommand>,
    more: &mut i64,
    metrics: &Arc<DriverMetrics>,
) -> anyhow::Result<()> {
    while *more > 0 {
        let Some(cmd) = queue.front_mut() else {
            break;
        };
        let remaining = &cmd.line.as_bytes()[cmd.written..];
        match stream.write(remaining) {
            Ok(0) => break,
            Ok(n) => {
                cmd.written += n;
                if cmd.written >= cmd.line.len() {
                    queue.pop_front();
                    *more -= 1;
                    metrics.commands_written.fetch_add(1, Relaxed);
                } else {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn flush_decode_pending(decode_w: RawFd, decode_pending: &mut VecDeque<u8>) {
    while !decode_pending.is_empty() {
        let (slice, _) = decode_pending.as_slices();
        let chunk = if slice.is_empty() {
            break;
        } else {
            slice
        };
        let n = unsafe { libc::write(decode_w, chunk.as_ptr() as *const _, chunk.len()) };
        if n <= 0 {
            break;
        }
        for _ in 0..n {
            decode_pending.pop_front();
        }
    }
}

/// Read from the decode pipe and frame complete objects out of the running
/// buffer. Frames are length-prefixed (`u32` big-endian length, then that
/// many bytes, see `codec::decode_object`); non-ping objects are discarded
/// silently, matching §4.4/§7.4.
fn read_decoded_objects(
    decode_r: RawFd,
    buf: &mut Vec<u8>,
    reply_tx: &Sender<PingReply>,
    metrics: &Arc<DriverMetrics>,
) {
    let mut tmp = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(decode_r, tmp.as_mut_ptr() as *mut _, tmp.len()) };
        if n <= 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n as usize]);
    }

    loop {
        if buf.len() < 4 {
            break;
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + len {
            break;
        }
        let frame: Vec<u8> = buf[4..4 + len].to_vec();
        buf.drain(..4 + len);
        match decode_object(&frame) {
            Ok(Some(reply)) => {
                let _ = reply_tx.send(reply);
            }
            Ok(None) => {} // non-ping object, discarded
            Err(e) => {
                tracing::debug!(error = %e, kind = %ErrorKind::DecodeFailure.as_str(), "failed to decode scamper object");
                metrics.decode_failures.fetch_add(1, Relaxed);
            }
        }
    }
}

fn close_all(fds: &[RawFd]) {
    for &fd in fds {
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// A loopback pair standing in for the driver's daemon socket and the
    /// daemon on the other end. `write_daemon`/`read_daemon` only need
    /// `Read + Write`, so a real (if local) TCP pair exercises them exactly
    /// as the daemon connection would without a live Scamper.
    fn make_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    fn cmd(line: &str) -> QueuedCommand {
        QueuedCommand {
            line: line.to_string(),
            written: 0,
        }
    }

    #[test]
    fn zero_credit_blocks_writes() {
        let (mut client, mut server) = make_pair();
        let mut queue = VecDeque::from([cmd("ping -c 1 10.0.0.1\n")]);
        let mut more = 0;
        let metrics = Arc::new(DriverMetrics::default());

        write_daemon(&mut client, &mut queue, &mut more, &metrics).unwrap();

        assert_eq!(queue.len(), 1, "command must stay queued while credit is zero");
        assert_eq!(metrics.commands_written.load(Relaxed), 0);
        let mut buf = [0u8; 64];
        assert!(matches!(
            server.read(&mut buf),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
        ));
    }

    #[test]
    fn one_credit_writes_exactly_one_queued_command() {
        let (mut client, mut server) = make_pair();
        let mut queue = VecDeque::from([cmd("ping -c 1 10.0.0.1\n"), cmd("ping -c 1 10.0.0.2\n")]);
        let mut more = 1;
        let metrics = Arc::new(DriverMetrics::default());

        write_daemon(&mut client, &mut queue, &mut more, &metrics).unwrap();

        assert_eq!(more, 0, "credit must be spent by the single write");
        assert_eq!(queue.len(), 1, "second command stays queued, no credit left for it");
        assert_eq!(metrics.commands_written.load(Relaxed), 1);

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping -c 1 10.0.0.1\n");
    }

    #[test]
    fn more_line_replenishes_credit_for_a_waiting_command() {
        // Scenario: daemon withdraws credit after one write, the next
        // request sits queued unwritten, then a MORE line frees it.
        let (mut client, mut server) = make_pair();
        let mut queue = VecDeque::from([cmd("ping -c 1 10.0.0.1\n")]);
        let mut more = 0;
        let metrics = Arc::new(DriverMetrics::default());

        write_daemon(&mut client, &mut queue, &mut more, &metrics).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(metrics.commands_written.load(Relaxed), 0);

        server.write_all(b"MORE\n").unwrap();

        let mut read_buf = [0u8; 4096];
        let mut residue = Vec::new();
        let mut expected_data_bytes = 0;
        let mut decode_pending = VecDeque::new();
        read_daemon(
            &mut client,
            &mut read_buf,
            &mut residue,
            &mut expected_data_bytes,
            &mut more,
            &mut decode_pending,
            &metrics,
        )
        .unwrap();
        assert_eq!(more, 1, "MORE must grant exactly one unit of credit");

        write_daemon(&mut client, &mut queue, &mut more, &metrics).unwrap();
        assert_eq!(more, 0);
        assert_eq!(queue.len(), 0);
        assert_eq!(metrics.commands_written.load(Relaxed), 1);

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping -c 1 10.0.0.1\n");
    }

    #[test]
    fn data_frame_line_is_not_mistaken_for_a_control_line() {
        // A DATA n announcement switches the reader into binary-accumulation
        // mode; the uuencoded lines that follow must not be parsed as OK/MORE.
        let (mut client, mut server) = make_pair();
        server.write_all(b"DATA 4\n").unwrap();
        server.write_all(b"!]T@3\n").unwrap();
        server.write_all(b"`\n").unwrap();

        let mut read_buf = [0u8; 4096];
        let mut residue = Vec::new();
        let mut expected_data_bytes = 0;
        let mut more = 0;
        let mut decode_pending = VecDeque::new();
        let metrics = Arc::new(DriverMetrics::default());
        read_daemon(
            &mut client,
            &mut read_buf,
            &mut residue,
            &mut expected_data_bytes,
            &mut more,
            &mut decode_pending,
            &metrics,
        )
        .unwrap();

        assert_eq!(more, 0, "uuencoded DATA lines must not be parsed as MORE");
    }
}
