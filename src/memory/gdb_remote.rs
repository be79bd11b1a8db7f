//! GDB remote serial protocol client
//!
//! Talks to a gdbstub (QEMU `-s`, a hardware probe, ...) over TCP and issues
//! only read requests:
//! - `m addr,length` for memory
//! - `p n` for a single register
//!
//! Packets are `$payload#cc` where `cc` is the modulo-256 sum of the payload
//! bytes in hex. Every packet is acknowledged with `+` (or `-` to request a
//! retransmission). Replies may use `}` escapes and `*` run-length encoding.
//!
//! A request that fails mid-exchange (timeout, bad ack) can leave part of a
//! reply in flight. The client then marks itself out of sync and, before the
//! next request, discards input up to the end of the stale packet.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, warn};

use super::{MemoryReader, Width};
use crate::error::ReadError;
use crate::types::KAddr;

/// Default socket timeout applied to reads and writes
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest memory request sent in a single `m` packet
const MAX_READ_CHUNK: usize = 0x400;

/// Chunk used when scanning for a string terminator
const CSTRING_CHUNK: usize = 0x40;

/// Retransmissions attempted after a `-` acknowledgement
const MAX_RETRANSMITS: usize = 3;

// ============================================================================
// Packet framing
// ============================================================================

/// Modulo-256 sum of the payload bytes
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Frame a payload as `$payload#cc`
pub fn encode_packet(payload: &str) -> Vec<u8> {
    format!("${}#{:02x}", payload, checksum(payload.as_bytes())).into_bytes()
}

/// Undo `}` escaping and `*` run-length encoding of a received payload
pub fn decode_payload(raw: &[u8]) -> Result<Vec<u8>, ReadError> {
    let mut out: Vec<u8> = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'}' => {
                let escaped = raw
                    .get(i + 1)
                    .ok_or_else(|| ReadError::Protocol("dangling escape".into()))?;
                out.push(escaped ^ 0x20);
                i += 2;
            }
            b'*' => {
                let prev = *out
                    .last()
                    .ok_or_else(|| ReadError::Protocol("run length without a character".into()))?;
                let count = raw
                    .get(i + 1)
                    .ok_or_else(|| ReadError::Protocol("truncated run length".into()))?;
                let repeat = count
                    .checked_sub(29)
                    .ok_or_else(|| ReadError::Protocol("invalid run length".into()))?;
                out.extend(std::iter::repeat(prev).take(repeat as usize));
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Parse an `Enn` error reply
fn parse_error_reply(reply: &str) -> Option<u8> {
    let code = reply.strip_prefix('E')?;
    if code.len() != 2 {
        return None;
    }
    u8::from_str_radix(code, 16).ok()
}

/// Fold little-endian bytes into an integer
fn le_value(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | ((*b as u64) << (8 * i)))
}

/// AArch64 register numbering used by gdbstubs without a custom target description
fn default_aarch64_registers() -> HashMap<String, u32> {
    let mut map: HashMap<String, u32> = (0..=30).map(|n| (format!("x{}", n), n)).collect();
    map.insert("fp".into(), 29);
    map.insert("lr".into(), 30);
    map.insert("sp".into(), 31);
    map.insert("pc".into(), 32);
    map.insert("cpsr".into(), 33);
    map
}

fn register_key(name: &str) -> String {
    name.trim().trim_start_matches('$').to_ascii_lowercase()
}

// ============================================================================
// Client
// ============================================================================

/// Read-only GDB remote protocol client
pub struct GdbRemote<S = TcpStream> {
    stream: RefCell<S>,
    registers: HashMap<String, u32>,
    /// Set when an exchange failed and stale reply bytes may be pending
    desynced: Cell<bool>,
}

impl GdbRemote<TcpStream> {
    /// Connect to a gdbstub listening on `addr`
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ReadError> {
        let socket_addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            ReadError::Protocol("remote address did not resolve".into())
        })?;
        let stream = TcpStream::connect(socket_addr)?;
        stream.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
        stream.set_write_timeout(Some(DEFAULT_TIMEOUT))?;
        stream.set_nodelay(true)?;
        debug!("connected to gdbstub at {}", socket_addr);
        Ok(Self::from_stream(stream))
    }
}

impl<S: Read + Write> GdbRemote<S> {
    /// Wrap an already-connected transport
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream: RefCell::new(stream),
            registers: default_aarch64_registers(),
            desynced: Cell::new(false),
        }
    }

    /// Map a register name (e.g. `TPIDR_EL1`) to the stub's register number
    pub fn with_register(mut self, name: &str, number: u32) -> Self {
        self.registers.insert(register_key(name), number);
        self
    }

    /// Send one request and return the decoded reply payload
    pub fn transact(&self, payload: &str) -> Result<String, ReadError> {
        let mut stream = self.stream.borrow_mut();
        if self.desynced.get() {
            resync(&mut *stream)?;
            self.desynced.set(false);
        }
        let result = exchange(&mut *stream, payload);
        if let Err(e) = &result {
            warn!("gdb remote: {:?} failed, resyncing before the next request: {}", payload, e);
            self.desynced.set(true);
        }
        result
    }

    /// Read `len` bytes of target memory
    pub fn read_memory(&self, addr: KAddr, len: usize) -> Result<Vec<u8>, ReadError> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk = (len - out.len()).min(MAX_READ_CHUNK);
            let at = addr.offset(out.len() as u64);
            let request = format!("m{:x},{:x}", at.raw(), chunk);
            let reply = self.transact(&request)?;
            if let Some(code) = parse_error_reply(&reply) {
                return Err(ReadError::Remote { request, code });
            }
            let bytes = hex::decode(&reply)
                .map_err(|e| ReadError::Protocol(format!("bad memory reply: {}", e)))?;
            if bytes.is_empty() {
                return Err(ReadError::Unmapped { address: at, len: chunk });
            }
            let short = bytes.len() < chunk;
            out.extend_from_slice(&bytes);
            if short {
                // Stubs return the readable prefix of a partially mapped range
                return Err(ReadError::Unmapped {
                    address: addr.offset(out.len() as u64),
                    len: len - out.len(),
                });
            }
        }
        Ok(out)
    }

    /// Read register `number` as a little-endian value
    pub fn read_register(&self, number: u32) -> Result<u64, ReadError> {
        let request = format!("p{:x}", number);
        let reply = self.transact(&request)?;
        if let Some(code) = parse_error_reply(&reply) {
            return Err(ReadError::Remote { request, code });
        }
        if reply.is_empty() {
            return Err(ReadError::Protocol(format!(
                "register {} is not supported by the stub",
                number
            )));
        }
        let bytes = hex::decode(&reply)
            .map_err(|e| ReadError::Protocol(format!("bad register reply: {}", e)))?;
        Ok(le_value(&bytes))
    }
}

/// One request/reply exchange on a stream that is in sync
fn exchange<S: Read + Write>(stream: &mut S, payload: &str) -> Result<String, ReadError> {
    let packet = encode_packet(payload);
    debug!("-> {}", payload);
    let mut acked = false;
    for _ in 0..=MAX_RETRANSMITS {
        stream.write_all(&packet)?;
        stream.flush()?;
        match read_byte(stream)? {
            b'+' => {
                acked = true;
                break;
            }
            b'-' => continue,
            other => {
                return Err(ReadError::Protocol(format!(
                    "expected acknowledgement, got {:?}",
                    other as char
                )))
            }
        }
    }
    if !acked {
        return Err(ReadError::Protocol(format!(
            "{:?} not acknowledged after {} retransmissions",
            payload, MAX_RETRANSMITS
        )));
    }

    let reply = read_packet(stream)?;
    let reply = String::from_utf8(reply)
        .map_err(|_| ReadError::Protocol("non-ASCII reply".into()))?;
    debug!("<- {}", reply);
    Ok(reply)
}

/// Read through the next `#` and its two checksum digits, counting bytes
fn drain_packet<S: Read>(stream: &mut S, discarded: &mut usize) -> io::Result<()> {
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        *discarded += 1;
        if byte[0] == b'#' {
            let mut sum = [0u8; 2];
            stream.read_exact(&mut sum)?;
            *discarded += 2;
            return Ok(());
        }
    }
}

/// Discard the rest of a stale packet; a timeout means nothing is pending
fn resync<S: Read + Write>(stream: &mut S) -> Result<(), ReadError> {
    let mut discarded = 0;
    match drain_packet(stream, &mut discarded) {
        Ok(()) => {
            debug!("resync: discarded {} bytes of a stale reply", discarded);
            stream.write_all(b"+")?;
            stream.flush()?;
            Ok(())
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            debug!("resync: line quiet after {} bytes", discarded);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn read_byte<S: Read>(stream: &mut S) -> Result<u8, ReadError> {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Read one `$...#cc` packet, acknowledging it
fn read_packet<S: Read + Write>(stream: &mut S) -> Result<Vec<u8>, ReadError> {
    loop {
        // Skip stray acks and notification noise until a packet starts
        while read_byte(stream)? != b'$' {}

        let mut raw = Vec::new();
        loop {
            match read_byte(stream)? {
                b'#' => break,
                b => raw.push(b),
            }
        }
        let mut sum = [0u8; 2];
        stream.read_exact(&mut sum)?;
        let expected = std::str::from_utf8(&sum)
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .ok_or_else(|| ReadError::Protocol("malformed checksum".into()))?;

        if checksum(&raw) != expected {
            debug!("checksum mismatch, requesting retransmission");
            stream.write_all(b"-")?;
            stream.flush()?;
            continue;
        }
        stream.write_all(b"+")?;
        stream.flush()?;
        return decode_payload(&raw);
    }
}

impl<S: Read + Write> MemoryReader for GdbRemote<S> {
    fn read_uint(&self, addr: KAddr, width: Width) -> Result<u64, ReadError> {
        let bytes = self.read_memory(addr, width.bytes())?;
        Ok(le_value(&bytes))
    }

    fn read_cstring(&self, addr: KAddr, max_len: usize) -> Result<String, ReadError> {
        let mut raw = Vec::new();
        while raw.len() < max_len {
            let chunk = (max_len - raw.len()).min(CSTRING_CHUNK);
            let at = addr.offset(raw.len() as u64);
            let bytes = match self.read_memory(at, chunk) {
                Ok(bytes) => bytes,
                Err(e) if raw.is_empty() => return Err(e),
                Err(_) => break,
            };
            match bytes.iter().position(|b| *b == 0) {
                Some(nul) => {
                    raw.extend_from_slice(&bytes[..nul]);
                    break;
                }
                None => raw.extend_from_slice(&bytes),
            }
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn evaluate(&self, expr: &str) -> Result<u64, ReadError> {
        let trimmed = expr.trim();
        if trimmed.starts_with('$') {
            let number = self
                .registers
                .get(&register_key(trimmed))
                .copied()
                .ok_or_else(|| ReadError::UnknownExpression(expr.to_string()))?;
            return self.read_register(number);
        }
        trimmed
            .parse::<KAddr>()
            .map(KAddr::raw)
            .map_err(|_| ReadError::UnknownExpression(expr.to_string()))
    }
}
