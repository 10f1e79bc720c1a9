//! Transport bootstrap: the rendezvous socket and private sockets.
//!
//! The daemon listens on a reserved TCP port registered with the local
//! portmapper (or on a descriptor inherited from a super-server). Trust
//! is decided per connection from the peer address alone: loopback
//! clients are served as the configured untrusted user (or trusted
//! outright under insecure compatibility), off-host peers speaking from
//! a privileged port are taken to be peer daemons and believed, and
//! everyone else is untrusted.
//!
//! A local client can ask (via `N` with a groups tail) for a private
//! Unix socket owned by its uid; connections accepted there are
//! authenticated by ownership of the socket file.

use std::io;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;
use log::info;

use crate::daemon::Daemon;
use crate::daemon::SessionId;
use crate::rpc;
use crate::scheduler::TimerKey;
use crate::scheduler::Token;
use crate::session::CredMode;

// How long an offered private socket waits for its connection.
const NEGOTIATION_WINDOW: Duration = Duration::from_secs(60);

// bindresvport territory.
const RESERVED_PORTS: std::ops::Range<u16> = 600..1024;

/// The rendezvous listener.
#[derive(Debug)]
pub struct Listener {
    pub socket: TcpListener,
    pub port: u16,
    pub by_superserver: bool,
}

/// A private socket waiting for its client to reconnect.
#[derive(Debug)]
pub struct Negotiation {
    pub listener: UnixListener,
    pub uid: libc::uid_t,
    pub path: PathBuf,
}

/// Whether descriptor 0 is a socket a super-server handed us. The
/// binary checks this before daemonizing, since daemonization redirects
/// the std descriptors to /dev/null and would destroy the inherited
/// rendezvous socket.
pub fn started_by_superserver() -> bool {
    nix::sys::stat::fstat(std::io::stdin())
        .map(|st| st.st_mode & libc::S_IFMT == libc::S_IFSOCK)
        .unwrap_or(false)
}

impl Daemon {
    /// Bind the rendezvous socket and register with the portmapper, or
    /// inherit descriptor 0 from a super-server. Failures here are
    /// startup-fatal.
    pub fn listener_init(&mut self) -> io::Result<()> {
        let inherited = started_by_superserver();

        let listener = if inherited {
            // A super-server cannot hand us a loopback-only socket.
            if self.config.local_only {
                error!("started by a super-server, so local_only is being ignored");
                self.config.local_only = false;
            }
            // The super-server registered us; descriptor 0 is the
            // listening socket.
            let socket = unsafe { TcpListener::from_raw_fd(0) };
            socket.set_nonblocking(true)?;
            Listener {
                socket,
                port: 0,
                by_superserver: true,
            }
        } else {
            let addr = if self.config.local_only {
                Ipv4Addr::LOCALHOST
            } else {
                Ipv4Addr::UNSPECIFIED
            };
            let (socket, port) = bind_reserved(addr)?;
            socket.set_nonblocking(true)?;
            rpc::pmap_unset_quietly(self.config.program, self.config.version);
            match rpc::pmap_set(self.config.program, self.config.version, port) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(io::Error::other("can't register with portmapper"));
                }
                Err(err) => {
                    return Err(io::Error::other(format!("portmapper unavailable: {err}")));
                }
            }
            Listener {
                socket,
                port,
                by_superserver: false,
            }
        };

        debug!(
            "listening for clients on descriptor {}",
            listener.socket.as_raw_fd()
        );
        self.sched
            .install_read(listener.socket.as_raw_fd(), Token::Rendezvous);
        self.listener = Some(listener);
        Ok(())
    }

    /// Withdraw the portmapper registration on the way out.
    pub fn listener_shutdown(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.sched.remove_read(listener.socket.as_raw_fd());
            if !listener.by_superserver {
                rpc::pmap_unset_quietly(self.config.program, self.config.version);
            }
            debug!("service closed");
        }
    }

    /// Accept pending clients and classify each one's trust.
    pub fn listener_accept(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.socket.accept(),
                None => return,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    error!("failed to accept new client: {}", err);
                    return;
                }
            };
            let Some(mode) = self.classify_peer(&peer) else {
                info!("refusing off-host connection from {}", peer);
                continue;
            };
            if let Err(err) = self.new_session(stream.into(), mode, None) {
                error!("can't set up client connection: {}", err);
            }
        }
    }

    fn classify_peer(&self, peer: &SocketAddr) -> Option<CredMode> {
        let loopback = peer.ip().is_loopback();
        if loopback {
            return Some(if self.config.insecure_compat {
                CredMode::TrustPayload
            } else {
                self.fixed_untrusted()
            });
        }
        if self.config.local_only {
            return None;
        }
        if peer.port() < 1024 {
            // A privileged source port off-host: a peer daemon speaking
            // for its own clients.
            Some(CredMode::TrustPayload)
        } else {
            Some(self.fixed_untrusted())
        }
    }

    fn fixed_untrusted(&self) -> CredMode {
        match &self.untrusted {
            Some(cred) => CredMode::Fixed(cred.clone()),
            // Startup refuses to run without an untrusted user; this arm
            // only serves tests.
            None => CredMode::TrustPayload,
        }
    }

    /// Offer a client a private Unix socket owned by `uid`, telling it
    /// the path in-band. The offer expires if nobody connects.
    pub fn create_private_socket(&mut self, sid: SessionId, uid: libc::uid_t) {
        let path = PathBuf::from(format!(
            "/tmp/.falter_{}_{}",
            std::process::id(),
            self.next_private_serial()
        ));
        let superuser = self.creds.superuser();
        self.creds.become_user(&superuser);
        let _ = std::fs::remove_file(&path);
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(err) => {
                error!("can't bind private socket {:?}: {}", path, err);
                return;
            }
        };
        if let Err(err) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .and_then(|_| {
                nix::unistd::chown(&path, Some(nix::unistd::Uid::from_raw(uid)), None)
                    .map_err(io::Error::from)
            })
        {
            error!("can't hand {:?} to uid {}: {}", path, uid, err);
            let _ = std::fs::remove_file(&path);
            return;
        }
        if listener.set_nonblocking(true).is_err() {
            let _ = std::fs::remove_file(&path);
            return;
        }

        let raw = listener.as_raw_fd();
        debug!(
            "listening for uid {} on descriptor {} ({:?})",
            uid, raw, path
        );
        self.sched.install_read(raw, Token::PrivateListener(raw));
        self.sched.install_oneshot(
            Instant::now() + NEGOTIATION_WINDOW,
            TimerKey::Negotiation(raw),
        );
        self.negotiations.insert(
            raw,
            Negotiation {
                listener,
                uid,
                path: path.clone(),
            },
        );

        // The reply is the bare socket path.
        let mut reply = path.as_os_str().as_bytes().to_vec();
        reply.push(0);
        self.session_send_raw(sid, &reply);
    }

    /// The client came back on its private socket.
    pub fn accept_private(&mut self, raw: RawFd) {
        let Some(negotiation) = self.negotiations.remove(&raw) else {
            return;
        };
        self.sched.remove_oneshot(TimerKey::Negotiation(raw));
        self.sched.remove_read(raw);
        let (stream, _) = match negotiation.listener.accept() {
            Ok(pair) => pair,
            Err(err) => {
                error!("failed to accept private client: {}", err);
                let _ = std::fs::remove_file(&negotiation.path);
                return;
            }
        };
        debug!(
            "client fd {} is local/trusted (socket {:?}, uid {})",
            stream.as_raw_fd(),
            negotiation.path,
            negotiation.uid
        );
        let cred = self.cred_for_uid(negotiation.uid);
        if let Err(err) = self.new_session(
            stream.into(),
            CredMode::Fixed(cred),
            Some(negotiation.path),
        ) {
            error!("can't set up private client: {}", err);
        }
        // The listening socket closes with `negotiation`; the path is
        // unlinked when the session ends.
    }

    /// Nobody claimed the private socket in time.
    pub fn negotiation_cleanup(&mut self, raw: RawFd) {
        let Some(negotiation) = self.negotiations.remove(&raw) else {
            return;
        };
        debug!(
            "cleaning up unclaimed private socket {:?}",
            negotiation.path
        );
        self.sched.remove_read(raw);
        let superuser = self.creds.superuser();
        self.creds.become_user(&superuser);
        let _ = std::fs::remove_file(&negotiation.path);
    }

    fn cred_for_uid(&mut self, uid: libc::uid_t) -> crate::cred::Cred {
        match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
            Ok(Some(user)) => self.creds.intern(uid, user.gid.as_raw(), &[]),
            _ => self.creds.intern(uid, uid, &[]),
        }
    }
}

// The loop bindresvport does, with std sockets.
fn bind_reserved(addr: Ipv4Addr) -> io::Result<(TcpListener, u16)> {
    for port in RESERVED_PORTS.rev() {
        match TcpListener::bind((addr, port)) {
            Ok(listener) => return Ok((listener, port)),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => continue,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "can't bind to a reserved port",
                ));
            }
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no reserved port available",
    ))
}
