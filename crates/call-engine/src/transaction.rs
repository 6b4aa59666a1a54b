//! Server-side transaction bookkeeping
//!
//! UDP SIP retransmits: a request re-arriving with the same Via branch,
//! CSeq and Call-ID within the transaction window gets the cached final
//! response re-sent instead of being processed again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tandem_sip_core::SipMessage;

/// How long a final response is re-served for retransmissions
/// (RFC 3261 Timer J territory: 64*T1).
const TRANSACTION_TTL: Duration = Duration::from_secs(32);

/// Identity of a server transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    branch: String,
    cseq: String,
    call_id: String,
}

impl TransactionKey {
    /// Build the key for a request. `None` when the request lacks the
    /// identifying headers (such a request is processed statelessly).
    pub fn of(msg: &SipMessage) -> Option<TransactionKey> {
        let via = msg.header("Via")?;
        let branch = via
            .split(';')
            .find_map(|p| p.trim().strip_prefix("branch="))?
            .to_string();
        Some(TransactionKey {
            branch,
            cseq: msg.header("CSeq")?.to_string(),
            call_id: msg.header("Call-ID")?.to_string(),
        })
    }
}

struct CachedResponse {
    wire: String,
    addr: SocketAddr,
    stored_at: Instant,
}

/// Cache of final responses keyed by transaction
#[derive(Default)]
pub struct TransactionCache {
    entries: Mutex<HashMap<TransactionKey, CachedResponse>>,
}

impl TransactionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached final response for a retransmitted request, if any.
    pub fn lookup(&self, key: &TransactionKey) -> Option<(String, SocketAddr)> {
        let entries = self.entries.lock();
        let cached = entries.get(key)?;
        if cached.stored_at.elapsed() >= TRANSACTION_TTL {
            return None;
        }
        Some((cached.wire.clone(), cached.addr))
    }

    /// Remember a final response. Provisional (1xx) responses are never
    /// cached; the transaction is still in progress.
    pub fn store(&self, key: TransactionKey, wire: String, addr: SocketAddr) {
        let mut entries = self.entries.lock();
        // Opportunistic sweep keeps the map bounded without a timer task
        entries.retain(|_, cached| cached.stored_at.elapsed() < TRANSACTION_TTL);
        entries.insert(
            key,
            CachedResponse {
                wire,
                addr,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(branch: &str, cseq: &str, call_id: &str) -> SipMessage {
        SipMessage::parse(&format!(
            "OPTIONS sip:pbx SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.2:5060;branch={branch}\r\n\
             CSeq: {cseq}\r\n\
             Call-ID: {call_id}\r\n\
             \r\n"
        ))
    }

    #[test]
    fn identical_requests_share_a_key() {
        let a = TransactionKey::of(&request("z9hG4bKabc", "1 OPTIONS", "c1")).unwrap();
        let b = TransactionKey::of(&request("z9hG4bKabc", "1 OPTIONS", "c1")).unwrap();
        assert_eq!(a, b);

        let c = TransactionKey::of(&request("z9hG4bKxyz", "1 OPTIONS", "c1")).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn missing_identifiers_yield_no_key() {
        let msg = SipMessage::parse("OPTIONS sip:pbx SIP/2.0\r\nCall-ID: c1\r\n\r\n");
        assert!(TransactionKey::of(&msg).is_none());
    }

    #[test]
    fn cached_response_is_reserved_for_retransmissions() {
        let cache = TransactionCache::new();
        let key = TransactionKey::of(&request("z9hG4bKabc", "1 OPTIONS", "c1")).unwrap();
        let addr: SocketAddr = "10.0.0.2:5060".parse().unwrap();

        assert!(cache.lookup(&key).is_none());
        cache.store(key.clone(), "SIP/2.0 200 OK\r\n\r\n".to_string(), addr);

        let (wire, cached_addr) = cache.lookup(&key).unwrap();
        assert!(wire.starts_with("SIP/2.0 200 OK"));
        assert_eq!(cached_addr, addr);
    }
}
