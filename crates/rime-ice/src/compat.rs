//! Per-dialect behavior differences, captured as one profile table instead of
//! scattered conditionals.

/// The peer dialect this agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// RFC 5245 ICE
    Rfc5245,
    /// Google Talk
    Google,
    /// MSN Messenger
    Msn,
    /// Windows Live Messenger 2009
    Wlm2009,
    /// Microsoft Office Communicator 2007
    Oc2007,
    /// Microsoft Office Communicator 2007 R2
    Oc2007R2,
}

/// How candidate priorities are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityScheme {
    /// RFC 5245 §4.1.2 formula over type preferences 126/110/100/0
    Rfc,
    /// Google Talk scalar priorities 1000/900/900/500
    Jingle,
    /// MSN scalar priorities 830/550/550/450
    MsnScalar,
}

/// Which TURN message set the relay speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnFlavor {
    Draft9,
    Rfc5766,
    Google,
    Msn,
    Oc2007,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NominationMode {
    /// The controlling agent re-checks the chosen pair with USE-CANDIDATE.
    Regular,
    /// Every controlling check carries USE-CANDIDATE.
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveStyle {
    /// STUN Binding indications, no response expected.
    Indication,
    /// Unauthenticated Binding requests, legacy dialects.
    LegacyRequest,
}

/// Behavior matrix for one [`Compatibility`] value.
#[derive(Debug, Clone, Copy)]
pub struct CompatProfile {
    pub priority: PriorityScheme,
    /// RFC 3489 style fully random 128-bit transaction ids.
    pub legacy_transaction_id: bool,
    /// Append FINGERPRINT to connectivity checks and responses.
    pub use_fingerprint: bool,
    /// XOR-MAPPED-ADDRESS vs legacy MAPPED-ADDRESS in responses.
    pub use_xor_mapped_address: bool,
    /// Emit the SOFTWARE attribute (when configured on the agent).
    pub emit_software: bool,
    /// `remote:local` usernames; false means plain concatenation.
    pub username_colon: bool,
    /// Inbound checks must carry a valid MESSAGE-INTEGRITY.
    pub require_integrity: bool,
    /// TURN/candidate credentials are base64 blobs that need decoding.
    pub base64_credentials: bool,
    pub nomination: NominationMode,
    pub keepalive: KeepaliveStyle,
    pub turn: TurnFlavor,
}

const RFC5245: CompatProfile = CompatProfile {
    priority: PriorityScheme::Rfc,
    legacy_transaction_id: false,
    use_fingerprint: true,
    use_xor_mapped_address: true,
    emit_software: true,
    username_colon: true,
    require_integrity: true,
    base64_credentials: false,
    nomination: NominationMode::Regular,
    keepalive: KeepaliveStyle::Indication,
    turn: TurnFlavor::Rfc5766,
};

const GOOGLE: CompatProfile = CompatProfile {
    priority: PriorityScheme::Jingle,
    legacy_transaction_id: true,
    use_fingerprint: false,
    use_xor_mapped_address: false,
    emit_software: false,
    username_colon: false,
    require_integrity: false,
    base64_credentials: false,
    nomination: NominationMode::Aggressive,
    keepalive: KeepaliveStyle::LegacyRequest,
    turn: TurnFlavor::Google,
};

const MSN: CompatProfile = CompatProfile {
    priority: PriorityScheme::MsnScalar,
    legacy_transaction_id: true,
    use_fingerprint: false,
    use_xor_mapped_address: false,
    emit_software: false,
    username_colon: true,
    require_integrity: true,
    base64_credentials: true,
    nomination: NominationMode::Aggressive,
    keepalive: KeepaliveStyle::LegacyRequest,
    turn: TurnFlavor::Msn,
};

const WLM2009: CompatProfile = CompatProfile {
    priority: PriorityScheme::Rfc,
    legacy_transaction_id: false,
    use_fingerprint: true,
    use_xor_mapped_address: true,
    emit_software: true,
    username_colon: true,
    require_integrity: true,
    base64_credentials: true,
    nomination: NominationMode::Aggressive,
    keepalive: KeepaliveStyle::Indication,
    turn: TurnFlavor::Msn,
};

const OC2007: CompatProfile = CompatProfile {
    priority: PriorityScheme::Rfc,
    legacy_transaction_id: false,
    use_fingerprint: false,
    use_xor_mapped_address: false,
    emit_software: false,
    username_colon: true,
    require_integrity: true,
    base64_credentials: true,
    nomination: NominationMode::Aggressive,
    keepalive: KeepaliveStyle::Indication,
    turn: TurnFlavor::Oc2007,
};

const OC2007R2: CompatProfile = CompatProfile {
    priority: PriorityScheme::Rfc,
    legacy_transaction_id: false,
    use_fingerprint: false,
    use_xor_mapped_address: true,
    emit_software: false,
    username_colon: true,
    require_integrity: true,
    base64_credentials: true,
    nomination: NominationMode::Regular,
    keepalive: KeepaliveStyle::Indication,
    turn: TurnFlavor::Oc2007,
};

impl Compatibility {
    pub const fn profile(self) -> &'static CompatProfile {
        match self {
            Compatibility::Rfc5245 => &RFC5245,
            Compatibility::Google => &GOOGLE,
            Compatibility::Msn => &MSN,
            Compatibility::Wlm2009 => &WLM2009,
            Compatibility::Oc2007 => &OC2007,
            Compatibility::Oc2007R2 => &OC2007R2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_dialects_use_long_transaction_ids() {
        assert!(Compatibility::Google.profile().legacy_transaction_id);
        assert!(Compatibility::Msn.profile().legacy_transaction_id);
        assert!(!Compatibility::Rfc5245.profile().legacy_transaction_id);
        assert!(!Compatibility::Wlm2009.profile().legacy_transaction_id);
    }

    #[test]
    fn nomination_modes() {
        assert_eq!(Compatibility::Rfc5245.profile().nomination, NominationMode::Regular);
        assert_eq!(Compatibility::Oc2007R2.profile().nomination, NominationMode::Regular);
        assert_eq!(Compatibility::Google.profile().nomination, NominationMode::Aggressive);
    }
}
