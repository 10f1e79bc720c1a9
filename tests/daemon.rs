//! End-to-end tests driving a full in-process reactor.
//!
//! Each test builds a real `Daemon` (mount table and all), hands it one
//! end of a socket pair as a client session, and pumps the reactor while
//! reading framed events off the other end. No privilege is needed: the
//! inode monitor device is absent, so everything runs on the polling
//! wheel, and credential switches are elided for unprivileged processes.
//!
//! The directory scanner chdirs, so these tests are serialised.

use std::fs;
use std::io::Read;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use serial_test::serial;

use falter::Config;
use falter::CredMode;
use falter::Daemon;

fn test_daemon() -> Daemon {
    let mut config = Config::default();
    config.poll_interval = Duration::from_millis(50);
    config.idle_timeout = Duration::ZERO;
    Daemon::new(config)
}

struct TestClient {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl TestClient {
    fn connect(daemon: &mut Daemon) -> TestClient {
        TestClient::connect_with_sndbuf(daemon, None)
    }

    fn connect_with_sndbuf(daemon: &mut Daemon, sndbuf: Option<usize>) -> TestClient {
        let (ours, theirs) = UnixStream::pair().unwrap();
        if let Some(size) = sndbuf {
            nix::sys::socket::setsockopt(&theirs, nix::sys::socket::sockopt::SndBuf, &size)
                .unwrap();
        }
        daemon
            .new_session(theirs.into(), CredMode::TrustPayload, None)
            .unwrap();
        ours.set_nonblocking(true).unwrap();
        TestClient {
            stream: ours,
            buf: Vec::new(),
        }
    }

    fn send(&mut self, payload: &[u8]) {
        let mut msg = (payload.len() as u32).to_be_bytes().to_vec();
        msg.extend_from_slice(payload);
        self.stream.write_all(&msg).unwrap();
    }

    fn monitor_file(&mut self, request: u32, path: &Path) {
        self.send(format!("W{} 0 0 {}\n\0", request, path.display()).as_bytes());
    }

    fn monitor_dir(&mut self, request: u32, path: &Path) {
        self.send(format!("M{} 0 0 {}\n\0", request, path.display()).as_bytes());
    }

    /// Pull whatever frames have arrived, as trimmed strings.
    fn drain(&mut self) -> Vec<String> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if self.buf.len() < 4 + len {
                break;
            }
            let payload = &self.buf[4..4 + len];
            let text = String::from_utf8_lossy(payload)
                .trim_end_matches(['\0', '\n'])
                .to_owned();
            frames.push(text);
            self.buf.drain(..4 + len);
        }
        frames
    }
}

/// Pump the reactor until the predicate holds or the timeout passes.
fn pump_until(
    daemon: &mut Daemon,
    client: &mut TestClient,
    events: &mut Vec<String>,
    timeout: Duration,
    mut done: impl FnMut(&[String]) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        events.extend(client.drain());
        if done(events) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        daemon.run_once().unwrap();
    }
}

fn settle(daemon: &mut Daemon, client: &mut TestClient, events: &mut Vec<String>, quiet: Duration) {
    let _ = pump_until(daemon, client, events, quiet, |_| false);
}

#[test]
#[serial]
fn single_file_watch_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("x");
    fs::write(&path, b"1234567").unwrap();

    let mut daemon = test_daemon();
    let mut client = TestClient::connect(&mut daemon);
    let mut events = Vec::new();

    client.monitor_file(1, &path);
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| !ev.is_empty()
    ));
    assert_eq!(events[0], format!("e1 {}", path.display()));

    // Touch: mtime and size move, one Changed arrives.
    fs::write(&path, b"12345678").unwrap();
    let want = format!("c1 c {}", path.display());
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev.contains(&want)
    ));

    // Remove, recreate: Deleted then Created, no Changed required.
    fs::remove_file(&path).unwrap();
    let want = format!("A1 {}", path.display());
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev.contains(&want)
    ));

    fs::write(&path, b"back").unwrap();
    let want = format!("F1 {}", path.display());
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev.contains(&want)
    ));
}

#[test]
#[serial]
fn directory_enumeration_and_reconciliation() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("d");
    fs::create_dir(&dir).unwrap();
    for name in ["a", "b", "c"] {
        fs::write(dir.join(name), name).unwrap();
    }

    let mut daemon = test_daemon();
    let mut client = TestClient::connect(&mut daemon);
    let mut events = Vec::new();

    client.monitor_dir(2, &dir);
    let end = format!("P2 {}", dir.display());
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev.contains(&end)
    ));

    // The directory's own Exists leads; every child announces itself
    // (in readdir order, which we don't pin down) before EndExist.
    assert_eq!(events[0], format!("e2 {}", dir.display()));
    let until_end: Vec<&String> = events.iter().take_while(|ev| **ev != end).collect();
    for name in ["a", "b", "c"] {
        let want = format!("e2 {}", name);
        assert!(
            until_end.iter().any(|ev| **ev == want),
            "missing {:?} in {:?}",
            want,
            events
        );
    }

    // A new entry is Created with its bare name.
    fs::write(dir.join("z"), b"z").unwrap();
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev.contains(&"F2 z".to_owned())
    ));

    // A removed entry is Deleted with its bare name.
    fs::remove_file(dir.join("b")).unwrap();
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev.contains(&"A2 b".to_owned())
    ));

    // Cancel acknowledges synchronously.
    client.send(b"C2 0 0\n\0");
    let want = format!("G2 {}", dir.display());
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev.contains(&want)
    ));
}

#[test]
#[serial]
fn suspend_resume_coalesces_changes() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("x");
    fs::write(&path, b"seed").unwrap();

    let mut daemon = test_daemon();
    let mut client = TestClient::connect(&mut daemon);
    let mut events = Vec::new();

    client.monitor_file(1, &path);
    fs::write(&path, b"first change").unwrap();
    let changed = format!("c1 c {}", path.display());
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev.contains(&changed)
    ));

    client.send(b"S1 0 0\n\0");
    settle(&mut daemon, &mut client, &mut events, Duration::from_millis(200));
    let quiet_mark = events.len();

    fs::write(&path, b"second change").unwrap();
    settle(&mut daemon, &mut client, &mut events, Duration::from_millis(200));
    fs::write(&path, b"third change, still suspended").unwrap();
    settle(&mut daemon, &mut client, &mut events, Duration::from_millis(200));
    assert_eq!(
        events.len(),
        quiet_mark,
        "no events while suspended: {:?}",
        &events[quiet_mark..]
    );

    client.send(b"U1 0 0\n\0");
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev[quiet_mark..].contains(&changed)
    ));
    settle(&mut daemon, &mut client, &mut events, Duration::from_millis(300));
    let after: Vec<&String> = events[quiet_mark..]
        .iter()
        .filter(|ev| **ev == changed)
        .collect();
    assert_eq!(after.len(), 1, "all suspended changes coalesce into one");
}

#[test]
#[serial]
fn relative_paths_are_acknowledged() {
    let mut daemon = test_daemon();
    let mut client = TestClient::connect(&mut daemon);
    let mut events = Vec::new();

    client.send(b"W9 0 0 not/absolute\n\0");
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev.contains(&"G9 not/absolute".to_owned())
    ));
}

#[test]
#[serial]
fn duplicate_request_ids_are_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("x");
    fs::write(&path, b"x").unwrap();

    let mut daemon = test_daemon();
    let mut client = TestClient::connect(&mut daemon);
    let mut events = Vec::new();

    client.monitor_file(1, &path);
    client.monitor_file(1, &path);
    settle(&mut daemon, &mut client, &mut events, Duration::from_millis(300));

    let exists = format!("e1 {}", path.display());
    let count = events.iter().filter(|ev| **ev == exists).count();
    assert_eq!(count, 1, "second monitor is dropped: {:?}", events);
}

#[test]
#[serial]
fn monitors_on_one_inode_share_an_identity_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("x");
    fs::write(&path, b"x").unwrap();

    let mut daemon = test_daemon();
    let mut client = TestClient::connect(&mut daemon);
    let mut events = Vec::new();

    client.monitor_file(1, &path);
    client.monitor_file(2, &path);
    settle(&mut daemon, &mut client, &mut events, Duration::from_millis(200));

    let st = nix::sys::stat::stat(&path).unwrap();
    let chain = daemon
        .identity
        .get(&(st.st_dev, st.st_ino))
        .cloned()
        .unwrap_or_default();
    assert_eq!(chain.len(), 2);

    client.send(b"C1 0 0\n\0");
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(3),
        |ev| ev.iter().any(|e| e.starts_with("G1 "))
    ));
    let chain = daemon
        .identity
        .get(&(st.st_dev, st.st_ino))
        .cloned()
        .unwrap_or_default();
    assert_eq!(chain.len(), 1, "cancelled monitor left the chain");
}

#[test]
#[serial]
fn big_directory_survives_backpressure() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("big");
    fs::create_dir(&dir).unwrap();
    let count = 1000;
    for i in 0..count {
        fs::write(dir.join(format!("f{:04}", i)), b"").unwrap();
    }

    let mut daemon = test_daemon();
    // A tiny send buffer forces the enumeration to block and resume.
    let mut client = TestClient::connect_with_sndbuf(&mut daemon, Some(4096));
    let mut events = Vec::new();

    client.monitor_dir(5, &dir);
    let end = format!("P5 {}", dir.display());
    assert!(pump_until(
        &mut daemon,
        &mut client,
        &mut events,
        Duration::from_secs(10),
        |ev| ev.contains(&end)
    ));

    // Nothing was dropped on the way through the suspensions.
    for i in 0..count {
        let want = format!("e5 f{:04}", i);
        assert!(events.contains(&want), "missing {}", want);
    }
    // EndExist arrives after every Exists.
    let end_at = events.iter().position(|ev| *ev == end).unwrap();
    assert!(events[..end_at].iter().filter(|ev| ev.starts_with("e5 ")).count() >= count);
}
