//! Minimal ONC RPC client plumbing for the portmapper.
//!
//! Just enough of the protocol to register our program with the local
//! portmapper at startup and to ask a remote portmapper which port the
//! peer daemon listens on: AUTH_NONE calls, accepted replies, TCP record
//! marking. Layouts are four-byte XDR throughout, encoded by hand.

use std::io;
use std::io::Read;
use std::io::Write;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use std::net::TcpStream;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::info;

pub const PMAP_PORT: u16 = 111;
pub const PMAP_PROGRAM: u32 = 100_000;
pub const PMAP_VERSION: u32 = 2;
pub const PMAPPROC_SET: u32 = 1;
pub const PMAPPROC_UNSET: u32 = 2;
pub const PMAPPROC_GETPORT: u32 = 3;
pub const IPPROTO_TCP: u32 = 6;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const RPC_VERSION: u32 = 2;
const REPLY_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;

const PMAP_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_XID: AtomicU32 = AtomicU32::new(0);

/// A transaction id unique enough for our two callers.
pub fn fresh_xid() -> u32 {
    let seed = NEXT_XID.fetch_add(1, Ordering::Relaxed);
    std::process::id().rotate_left(16) ^ seed
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn get_u32(buf: &[u8], at: usize) -> io::Result<u32> {
    let bytes: [u8; 4] = buf
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short RPC reply"))?;
    Ok(u32::from_be_bytes(bytes))
}

/// The four-word argument block of every portmapper procedure.
pub fn mapping_args(program: u32, version: u32, protocol: u32, port: u32) -> Vec<u8> {
    let mut args = Vec::with_capacity(16);
    put_u32(&mut args, program);
    put_u32(&mut args, version);
    put_u32(&mut args, protocol);
    put_u32(&mut args, port);
    args
}

/// Encode a call message, record mark included.
pub fn encode_call(xid: u32, program: u32, version: u32, procedure: u32, args: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(40 + args.len());
    put_u32(&mut body, xid);
    put_u32(&mut body, MSG_CALL);
    put_u32(&mut body, RPC_VERSION);
    put_u32(&mut body, program);
    put_u32(&mut body, version);
    put_u32(&mut body, procedure);
    put_u32(&mut body, 0); // cred: AUTH_NONE
    put_u32(&mut body, 0);
    put_u32(&mut body, 0); // verf: AUTH_NONE
    put_u32(&mut body, 0);
    body.extend_from_slice(args);

    let mut msg = Vec::with_capacity(4 + body.len());
    put_u32(&mut msg, 0x8000_0000 | body.len() as u32); // single final fragment
    msg.extend_from_slice(&body);
    msg
}

/// Split one record fragment off an accumulating buffer. Returns the
/// bytes consumed, the fragment payload, and whether it was the last
/// fragment of its record.
pub fn take_fragment(buf: &[u8]) -> io::Result<Option<(usize, &[u8], bool)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let mark = get_u32(buf, 0)?;
    let last = mark & 0x8000_0000 != 0;
    let len = (mark & 0x7fff_ffff) as usize;
    if len > 1 << 20 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unreasonable RPC fragment length",
        ));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some((4 + len, &buf[4..4 + len], last)))
}

/// Validate an accepted, successful reply body and return its results.
pub fn decode_reply(xid: u32, body: &[u8]) -> io::Result<&[u8]> {
    let bad = |what: &str| io::Error::new(io::ErrorKind::InvalidData, what.to_owned());
    if get_u32(body, 0)? != xid {
        return Err(bad("RPC reply xid mismatch"));
    }
    if get_u32(body, 4)? != MSG_REPLY {
        return Err(bad("not an RPC reply"));
    }
    if get_u32(body, 8)? != REPLY_ACCEPTED {
        return Err(bad("RPC call denied"));
    }
    // Skip the verifier: flavor, then an opaque body padded to 4 bytes.
    let verf_len = get_u32(body, 16)? as usize;
    let results_at = 20 + verf_len.div_ceil(4) * 4;
    if get_u32(body, results_at)? != ACCEPT_SUCCESS {
        return Err(bad("RPC call not successful"));
    }
    Ok(&body[results_at + 4..])
}

/// First word of a results block.
pub fn result_u32(results: &[u8]) -> io::Result<u32> {
    get_u32(results, 0)
}

/// Register `program.version` on `port` with the local portmapper.
pub fn pmap_set(program: u32, version: u32, port: u16) -> io::Result<bool> {
    let args = mapping_args(program, version, IPPROTO_TCP, u32::from(port));
    let results = local_call(PMAPPROC_SET, &args)?;
    Ok(result_u32(&results)? != 0)
}

/// Withdraw any registration of `program.version`.
pub fn pmap_unset(program: u32, version: u32) -> io::Result<bool> {
    let args = mapping_args(program, version, 0, 0);
    let results = local_call(PMAPPROC_UNSET, &args)?;
    Ok(result_u32(&results)? != 0)
}

// Blocking call against the local portmapper; only used during startup
// and shutdown, never from the reactor.
fn local_call(procedure: u32, args: &[u8]) -> io::Result<Vec<u8>> {
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, PMAP_PORT);
    let mut stream = TcpStream::connect_timeout(&addr.into(), PMAP_TIMEOUT)?;
    stream.set_read_timeout(Some(PMAP_TIMEOUT))?;
    stream.set_write_timeout(Some(PMAP_TIMEOUT))?;

    let xid = fresh_xid();
    stream.write_all(&encode_call(
        xid,
        PMAP_PROGRAM,
        PMAP_VERSION,
        procedure,
        args,
    ))?;

    let mut record = Vec::new();
    loop {
        let mut mark = [0u8; 4];
        stream.read_exact(&mut mark)?;
        let mark = u32::from_be_bytes(mark);
        let len = (mark & 0x7fff_ffff) as usize;
        let mut frag = vec![0u8; len];
        stream.read_exact(&mut frag)?;
        record.extend_from_slice(&frag);
        if mark & 0x8000_0000 != 0 {
            break;
        }
    }
    let results = decode_reply(xid, &record)?;
    Ok(results.to_vec())
}

/// Log-and-forget wrapper for the shutdown path.
pub fn pmap_unset_quietly(program: u32, version: u32) {
    if let Err(err) = pmap_unset(program, version) {
        info!("portmapper unset failed: {}", err);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn call_layout() {
        let msg = encode_call(7, PMAP_PROGRAM, PMAP_VERSION, PMAPPROC_GETPORT, &[]);
        // Record mark: final fragment of 40 bytes.
        assert_eq!(&msg[0..4], &(0x8000_0000u32 | 40).to_be_bytes());
        assert_eq!(&msg[4..8], &7u32.to_be_bytes()); // xid
        assert_eq!(&msg[8..12], &0u32.to_be_bytes()); // CALL
        assert_eq!(&msg[12..16], &2u32.to_be_bytes()); // RPC version
        assert_eq!(&msg[16..20], &PMAP_PROGRAM.to_be_bytes());
        assert_eq!(&msg[24..28], &PMAPPROC_GETPORT.to_be_bytes());
        assert_eq!(msg.len(), 44);
    }

    #[test]
    fn mapping_args_layout() {
        let args = mapping_args(391_002, 2, IPPROTO_TCP, 1023);
        assert_eq!(args.len(), 16);
        assert_eq!(&args[0..4], &391_002u32.to_be_bytes());
        assert_eq!(&args[12..16], &1023u32.to_be_bytes());
    }

    fn reply(xid: u32, port: u32) -> Vec<u8> {
        let mut body = Vec::new();
        for word in [xid, 1, 0, 0, 0, 0, port] {
            body.extend_from_slice(&word.to_be_bytes());
        }
        body
    }

    #[test]
    fn reply_round_trip() {
        let body = reply(99, 2048);
        let results = decode_reply(99, &body).unwrap();
        assert_eq!(result_u32(results).unwrap(), 2048);
    }

    #[test]
    fn reply_xid_mismatch_rejected() {
        let body = reply(99, 2048);
        assert!(decode_reply(100, &body).is_err());
    }

    #[test]
    fn fragment_reassembly() {
        let body = reply(1, 111);
        let mut wire = (0x8000_0000u32 | body.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(&body);

        assert!(take_fragment(&wire[..3]).unwrap().is_none());
        assert!(take_fragment(&wire[..10]).unwrap().is_none());
        let (consumed, frag, last) = take_fragment(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(frag, body.as_slice());
        assert!(last);
    }
}
