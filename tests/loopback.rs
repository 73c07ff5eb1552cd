//! Integration tests: real TCP loopback connections.
//!
//! Each test pairs sockline on one side with plain std sockets on the
//! other, so every byte crosses a real kernel socket buffer.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::IntoRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use sockline::{Error, RwHook, Source, Uuid, WriteOptions};

// ── Helpers ─────────────────────────────────────────────────────────

/// A connected (sockline uuid, std peer) pair over loopback.
fn sock_pair() -> (Uuid, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let local = TcpStream::connect(addr).unwrap();
    let (peer, _) = listener.accept().unwrap();
    local.set_nonblocking(true).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let uuid = sockline::open(local.into_raw_fd()).unwrap();
    (uuid, peer)
}

/// Read exactly `n` bytes from a blocking std stream.
fn read_exact_len(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    let mut total = 0;
    while total < n {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(read) => total += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error: {e}"),
        }
    }
    buf.truncate(total);
    buf
}

/// Read exactly `n` bytes through sockline, spinning on "no data yet".
fn sock_read_exact(uuid: Uuid, n: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(n);
    let mut chunk = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while out.len() < n {
        assert!(Instant::now() < deadline, "timed out reading {n} bytes");
        match sockline::read(uuid, &mut chunk) {
            Ok(0) => std::thread::sleep(Duration::from_millis(1)),
            Ok(got) => out.extend_from_slice(&chunk[..got]),
            Err(e) => panic!("sock read error: {e}"),
        }
    }
    out
}

/// Flush until the queue drains, pacing for a slow peer.
fn drain(uuid: Uuid) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while sockline::has_pending(uuid) {
        assert!(Instant::now() < deadline, "queue never drained");
        if sockline::flush(uuid).is_err() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ── Listen / accept / read / write ──────────────────────────────────

#[test]
fn listen_accept_ping_pong() {
    let server = sockline::listen("127.0.0.1", 0).expect("listen failed");
    let port = {
        // Recover the bound port from the raw descriptor.
        let fd = server.fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        assert_eq!(ret, 0);
        let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
        u16::from_be(sin.sin_port)
    };

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // The listening socket is non-blocking; the connection may not be
    // queued yet on the first try.
    let deadline = Instant::now() + Duration::from_secs(5);
    let conn = loop {
        match sockline::accept(server) {
            Ok(uuid) => break uuid,
            Err(_) => {
                assert!(Instant::now() < deadline, "accept never succeeded");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    };

    client.write_all(b"ping").unwrap();
    client.flush().unwrap();
    assert_eq!(sock_read_exact(conn, 4), b"ping");

    sockline::write(conn, b"pong").expect("write failed");
    sockline::flush_strong(conn);
    assert_eq!(read_exact_len(&mut client, 4), b"pong");

    sockline::force_close(conn);
    sockline::force_close(server);
}

#[test]
fn connect_inline_echo() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let echo = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let msg = read_exact_len(&mut stream, 4);
        stream.write_all(&msg).unwrap();
    });

    let uuid = sockline::connect("127.0.0.1", port).expect("connect failed");
    sockline::write(uuid, b"ping").expect("write failed");
    sockline::flush_strong(uuid);
    assert_eq!(sock_read_exact(uuid, 4), b"ping");

    echo.join().unwrap();
    sockline::force_close(uuid);
}

// ── Moved memory to a slow reader ───────────────────────────────────

struct CountingGuard {
    data: Vec<u8>,
    drops: Arc<AtomicUsize>,
}

impl sockline::SendGuard for CountingGuard {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for CountingGuard {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn guarded_megabyte_to_slow_reader() {
    let (uuid, mut peer) = sock_pair();
    let total = 1 << 20;
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let drops = Arc::new(AtomicUsize::new(0));

    let reader = std::thread::spawn(move || {
        let mut seen = Vec::with_capacity(total);
        let mut chunk = [0u8; 4096];
        while seen.len() < total {
            match peer.read(&mut chunk) {
                Ok(0) => break,
                Ok(got) => {
                    seen.extend_from_slice(&chunk[..got]);
                    // A deliberately slow consumer.
                    std::thread::sleep(Duration::from_micros(50));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => panic!("peer read error: {e}"),
            }
        }
        seen
    });

    let guard = sockline::GuardBox::new(CountingGuard {
        data: payload,
        drops: drops.clone(),
    });
    sockline::write2(uuid, Source::Guard(guard), &WriteOptions::default())
        .expect("write2 failed");
    drain(uuid);

    let seen = reader.join().unwrap();
    assert_eq!(seen.len(), total);
    assert_eq!(seen, expected);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    sockline::force_close(uuid);
}

#[test]
fn moved_vec_delivered_in_order() {
    let (uuid, mut peer) = sock_pair();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 199) as u8).collect();
    let expected = payload.clone();

    sockline::write2(uuid, Source::Move(payload), &WriteOptions::default())
        .expect("write2 failed");
    let reader = std::thread::spawn(move || read_exact_len(&mut peer, expected.len()) == expected);
    drain(uuid);
    assert!(reader.join().unwrap());
    sockline::force_close(uuid);
}

// ── File segments ───────────────────────────────────────────────────

fn temp_file(tag: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("sockline-loopback-{tag}-{}", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn file_segment_owned_descriptor() {
    let (uuid, mut peer) = sock_pair();
    let path = temp_file("zeros", &[0u8; 100]);

    let file = std::fs::File::open(&path).unwrap();
    let opts = WriteOptions {
        length: Some(100),
        ..Default::default()
    };
    sockline::write2(uuid, Source::File(file), &opts).expect("write2 failed");
    drain(uuid);

    let seen = read_exact_len(&mut peer, 100);
    assert_eq!(seen, vec![0u8; 100]);

    sockline::force_close(uuid);
    std::fs::remove_file(&path).ok();
}

#[test]
fn file_segment_borrowed_descriptor_with_offset() {
    use std::os::fd::AsRawFd;

    let (uuid, mut peer) = sock_pair();
    let path = temp_file("digits", b"0123456789");

    let file = std::fs::File::open(&path).unwrap();
    let opts = WriteOptions {
        offset: 2,
        length: Some(5),
        ..Default::default()
    };
    sockline::write2(uuid, Source::FileRef(file.as_raw_fd()), &opts).expect("write2 failed");
    drain(uuid);

    assert_eq!(read_exact_len(&mut peer, 5), b"23456");
    // The caller kept ownership; the descriptor is still live.
    assert_eq!(file.metadata().unwrap().len(), 10);

    sockline::force_close(uuid);
    std::fs::remove_file(&path).ok();
}

// ── flush_all across connections ────────────────────────────────────

#[test]
fn flush_all_drains_every_queue() {
    let pairs: Vec<(Uuid, TcpStream)> = (0..3).map(|_| sock_pair()).collect();
    let mut expected = Vec::new();
    for (i, (uuid, _)) in pairs.iter().enumerate() {
        let mut wanted = Vec::new();
        for j in 0..10 {
            let msg = format!("conn-{i}-msg-{j};");
            sockline::write(*uuid, msg.as_bytes()).expect("write failed");
            wanted.extend_from_slice(msg.as_bytes());
        }
        expected.push(wanted);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while pairs.iter().any(|(uuid, _)| sockline::has_pending(*uuid)) {
        assert!(Instant::now() < deadline, "flush_all never drained");
        sockline::flush_all();
        std::thread::sleep(Duration::from_millis(1));
    }

    for ((uuid, mut peer), wanted) in pairs.into_iter().zip(expected) {
        let seen = read_exact_len(&mut peer, wanted.len());
        assert_eq!(seen, wanted);
        sockline::force_close(uuid);
    }
}

// ── Concurrency ─────────────────────────────────────────────────────

#[test]
fn parallel_writers_one_connection() {
    let (uuid, mut peer) = sock_pair();
    let writers = 8;
    let block = 1024;

    let reader = std::thread::spawn(move || read_exact_len(&mut peer, writers * block));

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            std::thread::spawn(move || {
                let data = vec![i as u8; block];
                sockline::write(uuid, &data).expect("write failed");
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    drain(uuid);

    let seen = reader.join().unwrap();
    assert_eq!(seen.len(), writers * block);
    // Every writer's block arrived in full (ordering between writers is
    // unspecified, packet contents are never interleaved).
    for i in 0..writers {
        assert_eq!(
            seen.iter().filter(|&&b| b == i as u8).count(),
            block,
            "writer {i} bytes missing"
        );
    }
    sockline::force_close(uuid);
}

// ── Failing transport hook ──────────────────────────────────────────

struct BrokenPipeHook {
    cleared: Arc<spin::Mutex<Vec<Uuid>>>,
}

impl RwHook for BrokenPipeHook {
    fn read(&self, _: Uuid, _: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::EAGAIN))
    }
    fn write(&self, _: Uuid, _: &[u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::EPROTO))
    }
    fn on_clear(&self, uuid: Uuid) {
        self.cleared.lock().push(uuid);
    }
}

#[test]
fn fatal_hook_error_force_closes_once() {
    let (uuid, _peer) = sock_pair();
    let cleared = Arc::new(spin::Mutex::new(Vec::new()));
    sockline::rw_hook_set(
        uuid,
        Arc::new(BrokenPipeHook {
            cleared: cleared.clone(),
        }),
    )
    .expect("hook install failed");

    // The write is accepted; the immediate flush hits EPROTO and
    // force-closes the connection.
    sockline::write(uuid, b"doomed").expect("write should queue");

    assert!(!sockline::is_valid(uuid));
    assert!(!sockline::has_pending(uuid));
    let cleared = cleared.lock();
    assert_eq!(cleared.as_slice(), &[uuid], "on_clear must run exactly once");
}

// ── Stale UUIDs ─────────────────────────────────────────────────────

#[test]
fn stale_uuid_rejected_after_force_close() {
    let (uuid, _peer) = sock_pair();
    assert!(sockline::is_valid(uuid));
    let generation_before = sockline::fd2uuid(uuid.fd()).unwrap();

    sockline::force_close(uuid);
    assert!(!sockline::is_valid(uuid));
    assert!(matches!(
        sockline::write(uuid, b"late"),
        Err(Error::InvalidConnection)
    ));
    assert!(matches!(
        sockline::read(uuid, &mut [0u8; 8]),
        Err(Error::InvalidConnection)
    ));
    assert!(sockline::flush(uuid).is_err());
    assert_eq!(sockline::fd2uuid(uuid.fd()), None);

    // A new connection reusing the descriptor is unaffected by calls
    // made with the stale handle.
    let (fresh, mut peer) = sock_pair();
    if fresh.fd() == uuid.fd() {
        assert_ne!(fresh, generation_before);
        assert!(matches!(
            sockline::write(uuid, b"late"),
            Err(Error::InvalidConnection)
        ));
    }
    sockline::write(fresh, b"fresh").expect("fresh write failed");
    sockline::flush_strong(fresh);
    assert_eq!(read_exact_len(&mut peer, 5), b"fresh");
    sockline::force_close(fresh);
}

#[test]
fn close_completes_after_drain() {
    let (uuid, mut peer) = sock_pair();
    sockline::write(uuid, b"last words").expect("write failed");
    sockline::close(uuid);
    drain(uuid);
    // Graceful close: the queued bytes arrive, then EOF.
    assert_eq!(read_exact_len(&mut peer, 10), b"last words");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "peer never saw EOF");
        let mut probe = [0u8; 1];
        match peer.read(&mut probe) {
            Ok(0) => break,
            Ok(_) => panic!("unexpected extra data"),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("peer read error: {e}"),
        }
    }
    assert!(!sockline::is_valid(uuid));
}
