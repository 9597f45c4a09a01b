//! DNS reverse cache
//!
//! Domain rules can only match IP packets when the router knows which name
//! an address was resolved from. DNS answers seen on the return path are fed
//! in here; entries expire with the record TTL.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 4096;
/// Floor applied to tiny TTLs so entries survive long enough to route the
/// connection that follows the lookup
const MIN_TTL: Duration = Duration::from_secs(10);
const MAX_TTL: Duration = Duration::from_secs(3600);

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;

struct Entry {
    domain: String,
    expires: Instant,
}

/// LRU map from resolved address to the queried name
pub struct DnsCache {
    entries: Mutex<LruCache<IpAddr, Entry>>,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn insert(&self, ip: IpAddr, domain: impl Into<String>, ttl: Duration) {
        let ttl = ttl.clamp(MIN_TTL, MAX_TTL);
        self.entries.lock().put(
            ip,
            Entry {
                domain: domain.into(),
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Domain the address was resolved from, if still fresh
    pub fn lookup(&self, ip: &IpAddr) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(ip) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.domain.clone()),
            Some(_) => {
                entries.pop(ip);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Learn A/AAAA answers from a DNS response payload.
    ///
    /// Returns the number of addresses learned. Anything that does not parse
    /// as a response is ignored.
    pub fn learn_response(&self, payload: &[u8]) -> usize {
        let answers = match parse_response(payload) {
            Some(answers) => answers,
            None => return 0,
        };
        let count = answers.len();
        for (ip, domain, ttl) in answers {
            trace!("[DNS] {} -> {} (ttl {}s)", ip, domain, ttl.as_secs());
            self.insert(ip, domain, ttl);
        }
        count
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Extract (address, question name, ttl) triples from a DNS response
fn parse_response(msg: &[u8]) -> Option<Vec<(IpAddr, String, Duration)>> {
    if msg.len() < 12 {
        return None;
    }
    let flags = u16::from_be_bytes([msg[2], msg[3]]);
    // QR must be set and RCODE must be NOERROR
    if flags & 0x8000 == 0 || flags & 0x000F != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    let ancount = u16::from_be_bytes([msg[6], msg[7]]);
    if qdcount == 0 {
        return None;
    }

    let mut pos = 12;
    let (question, next) = read_name(msg, pos)?;
    pos = next + 4;
    for _ in 1..qdcount {
        let (_, next) = read_name(msg, pos)?;
        pos = next + 4;
    }

    let mut answers = Vec::new();
    for _ in 0..ancount {
        let (_, next) = read_name(msg, pos)?;
        pos = next;
        let header = msg.get(pos..pos + 10)?;
        let rtype = u16::from_be_bytes([header[0], header[1]]);
        let ttl = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let rdlen = u16::from_be_bytes([header[8], header[9]]) as usize;
        pos += 10;
        let rdata = msg.get(pos..pos + rdlen)?;
        pos += rdlen;

        let ip = match (rtype, rdlen) {
            (TYPE_A, 4) => IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => continue,
        };
        answers.push((ip, question.clone(), Duration::from_secs(ttl as u64)));
    }
    Some(answers)
}

/// Read a possibly compressed name starting at `pos`.
///
/// Returns the lowercase dotted name and the offset just past the name in
/// the original position (not the pointer target).
fn read_name(msg: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *msg.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = *msg.get(pos + 1)? as usize;
            if end.is_none() {
                end = Some(pos + 2);
            }
            jumps += 1;
            if jumps > 16 {
                return None;
            }
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }
        let label = msg.get(pos + 1..pos + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).to_lowercase());
        pos += 1 + len;
    }

    Some((labels.join("."), end.unwrap_or(pos)))
}
