//! Construction and validation of the STUN messages the check engine and
//! keepalive path exchange.

use crate::compat::{CompatProfile, KeepaliveStyle};
use base64::prelude::{Engine, BASE64_STANDARD};
use rime_stun_types::attributes::{
    ErrorCode, IceControlled, IceControlling, MappedAddress, MsXorMappedAddress, Priority,
    Software, UseCandidate, Username, XorMappedAddress,
};
use rime_stun_types::{Class, IntegrityKey, Message, MessageBuilder, Method, TransactionId};
use std::cmp::min;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub(crate) struct StunConfig {
    pub(crate) initial_rto: Duration,
    pub(crate) max_rto: Duration,
    pub(crate) max_check_attempts: u32,
    pub(crate) max_allocate_attempts: u32,
}

impl StunConfig {
    pub(crate) fn new() -> Self {
        Self {
            initial_rto: Duration::from_millis(500),
            max_rto: Duration::from_secs(8),
            max_check_attempts: 7,
            max_allocate_attempts: 9,
        }
    }

    /// Doubling backoff, capped.
    pub(crate) fn retransmit_delta(&self, attempts: u32) -> Duration {
        let millis = (self.initial_rto.as_millis() as u64) << min(attempts, 16);
        min(Duration::from_millis(millis), self.max_rto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetransmitAction {
    Wait,
    Retransmit,
    TimedOut,
}

/// Per-transaction retransmission state. The first transmission happens when
/// the transaction is created and counts as attempt one.
#[derive(Debug)]
pub(crate) struct RetransmitTimer {
    next: Instant,
    attempts: u32,
    max_attempts: u32,
}

impl RetransmitTimer {
    pub(crate) fn new(now: Instant, config: &StunConfig, max_attempts: u32) -> Self {
        RetransmitTimer {
            next: now + config.retransmit_delta(0),
            attempts: 1,
            max_attempts,
        }
    }

    pub(crate) fn poll(&mut self, now: Instant, config: &StunConfig) -> RetransmitAction {
        if now < self.next {
            return RetransmitAction::Wait;
        }
        if self.attempts >= self.max_attempts {
            return RetransmitAction::TimedOut;
        }

        self.attempts += 1;
        self.next = now + config.retransmit_delta(self.attempts - 1);
        RetransmitAction::Retransmit
    }

    /// Force the next poll to retransmit immediately (triggered re-check of
    /// an in-progress pair).
    pub(crate) fn restart(&mut self, now: Instant) {
        self.next = now;
    }

    pub(crate) fn timeout(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }
}

pub(crate) fn new_transaction_id(profile: &CompatProfile) -> TransactionId {
    if profile.legacy_transaction_id {
        TransactionId::random_legacy()
    } else {
        TransactionId::random()
    }
}

/// Outbound username: `remote:local`, or plain concatenation for dialects
/// without the separator.
pub(crate) fn check_username(profile: &CompatProfile, remote_ufrag: &str, local_ufrag: &str) -> String {
    if profile.username_colon {
        format!("{remote_ufrag}:{local_ufrag}")
    } else {
        format!("{remote_ufrag}{local_ufrag}")
    }
}

pub(crate) fn integrity_key(profile: &CompatProfile, pwd: &str) -> IntegrityKey {
    if profile.base64_credentials {
        if let Ok(raw) = BASE64_STANDARD.decode(pwd) {
            return IntegrityKey::raw(raw);
        }
    }
    IntegrityKey::short_term(pwd)
}

pub(crate) struct CheckRequest<'a> {
    pub(crate) profile: &'static CompatProfile,
    pub(crate) software: Option<&'a str>,
    pub(crate) username: String,
    pub(crate) remote_pwd: &'a str,
    pub(crate) priority: u32,
    pub(crate) controlling: bool,
    pub(crate) tie_breaker: u64,
    pub(crate) use_candidate: bool,
}

pub(crate) fn make_check_request(tid: TransactionId, req: &CheckRequest<'_>) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Class::Request, Method::Binding, tid);

    builder.add_attr(&Username::new(req.username.clone()));
    builder.add_attr(&Priority(req.priority));

    if req.controlling {
        builder.add_attr(&IceControlling(req.tie_breaker));
    } else {
        builder.add_attr(&IceControlled(req.tie_breaker));
    }

    if req.use_candidate {
        builder.add_attr(&UseCandidate);
    }

    if req.profile.emit_software {
        if let Some(software) = req.software {
            builder.add_attr(&Software::new(software));
        }
    }

    builder.add_message_integrity(&integrity_key(req.profile, req.remote_pwd));

    if req.profile.use_fingerprint {
        builder.add_fingerprint();
    }

    builder.finish()
}

pub(crate) fn make_check_response(
    profile: &CompatProfile,
    tid: TransactionId,
    software: Option<&str>,
    local_pwd: &str,
    mapped: SocketAddr,
) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Class::Success, Method::Binding, tid);

    if profile.use_xor_mapped_address {
        builder.add_attr(&XorMappedAddress(mapped));
    } else {
        builder.add_attr(&MappedAddress(mapped));
        builder.add_attr(&MsXorMappedAddress(mapped));
    }

    if profile.emit_software {
        if let Some(software) = software {
            builder.add_attr(&Software::new(software));
        }
    }

    builder.add_message_integrity(&integrity_key(profile, local_pwd));

    if profile.use_fingerprint {
        builder.add_fingerprint();
    }

    builder.finish()
}

pub(crate) fn make_error_response(
    profile: &CompatProfile,
    tid: TransactionId,
    code: u16,
    reason: &str,
    local_pwd: Option<&str>,
    role: Option<(bool, u64)>,
) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Class::Error, Method::Binding, tid);

    builder.add_attr(&ErrorCode::new(code, reason));

    if let Some((controlling, tie_breaker)) = role {
        if controlling {
            builder.add_attr(&IceControlling(tie_breaker));
        } else {
            builder.add_attr(&IceControlled(tie_breaker));
        }
    }

    if let Some(pwd) = local_pwd {
        builder.add_message_integrity(&integrity_key(profile, pwd));
    }

    if profile.use_fingerprint {
        builder.add_fingerprint();
    }

    builder.finish()
}

/// Keepalive traffic on the selected pair: a Binding indication, or for
/// legacy dialects a bare Binding request whose answer is ignored.
pub(crate) fn make_keepalive(profile: &CompatProfile) -> Vec<u8> {
    let tid = new_transaction_id(profile);

    let class = match profile.keepalive {
        KeepaliveStyle::Indication => Class::Indication,
        KeepaliveStyle::LegacyRequest => Class::Request,
    };

    let mut builder = MessageBuilder::new(class, Method::Binding, tid);
    if profile.use_fingerprint {
        builder.add_fingerprint();
    }
    builder.finish()
}

/// Integrity check on an inbound connectivity-check message. Requests are
/// keyed on our password, responses on the peer's.
pub(crate) fn verify_inbound(
    profile: &CompatProfile,
    msg: &Message,
    local_pwd: &str,
    remote_pwd: Option<&str>,
) -> bool {
    if !msg.has_integrity() {
        return !profile.require_integrity;
    }

    let key = match msg.class() {
        Class::Request | Class::Indication => integrity_key(profile, local_pwd),
        Class::Success | Class::Error => match remote_pwd {
            Some(pwd) => integrity_key(profile, pwd),
            None => return false,
        },
    };

    msg.verify_integrity(&key)
}

/// The mapped address of a response under the dialect's attribute set.
pub(crate) fn response_mapped_address(profile: &CompatProfile, msg: &Message) -> Option<SocketAddr> {
    if profile.use_xor_mapped_address {
        if let Some(Ok(mapped)) = msg.attribute::<XorMappedAddress>() {
            return Some(mapped.0);
        }
    }
    if let Some(Ok(mapped)) = msg.attribute::<MsXorMappedAddress>() {
        return Some(mapped.0);
    }
    if let Some(Ok(mapped)) = msg.attribute::<MappedAddress>() {
        return Some(mapped.0);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::Compatibility;

    #[test]
    fn retransmit_schedule_caps_attempts() {
        let config = StunConfig::new();
        let start = Instant::now();
        let mut timer = RetransmitTimer::new(start, &config, 3);

        assert_eq!(timer.poll(start, &config), RetransmitAction::Wait);

        let mut now = start;
        let mut sends = 1;
        for _ in 0..32 {
            now += Duration::from_secs(10);
            match timer.poll(now, &config) {
                RetransmitAction::Retransmit => sends += 1,
                RetransmitAction::TimedOut => break,
                RetransmitAction::Wait => {}
            }
        }
        assert_eq!(sends, 3);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = StunConfig::new();
        assert_eq!(config.retransmit_delta(0), Duration::from_millis(500));
        assert_eq!(config.retransmit_delta(1), Duration::from_secs(1));
        assert_eq!(config.retransmit_delta(2), Duration::from_secs(2));
        assert_eq!(config.retransmit_delta(10), Duration::from_secs(8));
    }

    #[test]
    fn request_contents_follow_the_dialect() {
        let profile = Compatibility::Rfc5245.profile();
        let req = CheckRequest {
            profile,
            software: Some("rime"),
            username: check_username(profile, "remoteufrag", "localufrag"),
            remote_pwd: "remote-password-remote-pass",
            priority: 1234,
            controlling: true,
            tie_breaker: 99,
            use_candidate: true,
        };

        let bytes = make_check_request(new_transaction_id(profile), &req);
        let msg = Message::parse(bytes).unwrap();

        assert_eq!(
            msg.attribute::<Username>().unwrap().unwrap().0,
            "remoteufrag:localufrag"
        );
        assert!(msg.attribute::<UseCandidate>().is_some());
        assert!(msg.attribute::<IceControlling>().is_some());
        assert!(msg.verify_fingerprint());
        // the receiver's local password is what the request was keyed with
        assert!(verify_inbound(profile, &msg, "remote-password-remote-pass", None));
        assert!(msg.transaction_id().has_magic_cookie());
    }

    #[test]
    fn google_usernames_concatenate() {
        let profile = Compatibility::Google.profile();
        assert_eq!(check_username(profile, "a", "b"), "ab");
        assert!(!new_transaction_id(profile).has_magic_cookie());
    }

    #[test]
    fn legacy_response_uses_mapped_address() {
        let profile = Compatibility::Msn.profile();
        let tid = new_transaction_id(profile);
        let mapped = "10.1.2.3:4444".parse().unwrap();
        let bytes = make_check_response(profile, tid, None, "cHdk", mapped);
        let msg = Message::parse(bytes).unwrap();

        assert!(msg.attribute::<XorMappedAddress>().is_none());
        assert_eq!(response_mapped_address(profile, &msg), Some(mapped));
    }
}
