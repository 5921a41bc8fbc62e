//! Auditor trust set (spec §4.2).
//!
//! A small, read-only-after-startup collection built from
//! `merchant-auditor-<name>` sections. `check_denomination` is the only
//! decision this module makes: whether to accept a denomination key an
//! exchange claims is valid.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::config::{AuditorSection, Config};
use crate::types::PublicKey32;

/// A `(name, uri, public_key)` tuple the merchant trusts to vouch for
/// exchange denomination keys (spec §3).
#[derive(Debug, Clone)]
pub struct Auditor {
    pub name: String,
    pub uri: String,
    pub public_key: PublicKey32,
}

/// A minimal view of a denomination key, as presented by an exchange's
/// `/keys` response, sufficient to run `check_denomination`.
#[derive(Debug, Clone, Copy)]
pub struct DenominationKey {
    pub key_hash: PublicKey32,
    pub expire_deposit: DateTime<Utc>,
}

/// An auditor's vouch for a specific denomination key, as listed in an
/// exchange's `/keys` response for that denomination.
#[derive(Debug, Clone, Copy)]
pub struct AuditorVouch {
    pub auditor_pub: PublicKey32,
    pub denom_key_hash: PublicKey32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenominationVerdict {
    Accept,
    Expired,
    Untrusted,
}

pub struct AuditorTrustSet {
    auditors: Vec<Auditor>,
    /// The trust set serialized once for inclusion verbatim in signed
    /// contracts (spec §4.2: "published as a JSON array used verbatim").
    json: Value,
}

impl AuditorTrustSet {
    pub fn load(config: &Config) -> Self {
        let auditors: Vec<Auditor> = config
            .auditors
            .iter()
            .map(|s: &AuditorSection| Auditor {
                name: s.name.clone(),
                uri: s.uri.clone(),
                public_key: s.public_key,
            })
            .collect();
        let json = json!(auditors
            .iter()
            .map(|a| json!({
                "auditor_pub": a.public_key.to_base32(),
                "auditor_url": a.uri,
                "name": a.name,
            }))
            .collect::<Vec<_>>());
        Self { auditors, json }
    }

    pub fn iterate(&self) -> impl Iterator<Item = &Auditor> {
        self.auditors.iter()
    }

    /// The trust set as the JSON array signed into contracts.
    pub fn as_json(&self) -> &Value {
        &self.json
    }

    fn is_trusted_auditor(&self, pubkey: &PublicKey32) -> bool {
        self.auditors.iter().any(|a| &a.public_key == pubkey)
    }

    /// `check_denomination(exchange_handle, dk, exchange_trusted)` (spec §4.2).
    ///
    /// `exchange_trusted` is whether the exchange itself is in
    /// `TRUSTED_EXCHANGES`; `exchange_auditor_vouches` is the set of
    /// auditor-to-denomination vouches the exchange's own `/keys` response
    /// lists for `dk`.
    pub fn check_denomination(
        &self,
        dk: &DenominationKey,
        exchange_trusted: bool,
        exchange_auditor_vouches: &[AuditorVouch],
        now: DateTime<Utc>,
    ) -> DenominationVerdict {
        if dk.expire_deposit < now {
            return DenominationVerdict::Expired;
        }
        if exchange_trusted {
            return DenominationVerdict::Accept;
        }
        let vouched = exchange_auditor_vouches.iter().any(|v| {
            v.denom_key_hash == dk.key_hash && self.is_trusted_auditor(&v.auditor_pub)
        });
        if vouched {
            DenominationVerdict::Accept
        } else {
            DenominationVerdict::Untrusted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn auditor(pk: [u8; 32]) -> Auditor {
        Auditor {
            name: "Test Auditor".to_string(),
            uri: "https://auditor.example".to_string(),
            public_key: crate::types::HashCode(pk),
        }
    }

    fn set(auditors: Vec<Auditor>) -> AuditorTrustSet {
        let json = json!(auditors
            .iter()
            .map(|a| json!({"auditor_pub": a.public_key.to_base32(), "auditor_url": a.uri, "name": a.name}))
            .collect::<Vec<_>>());
        AuditorTrustSet { auditors, json }
    }

    #[test]
    fn expired_denomination_is_rejected_even_if_exchange_trusted() {
        let ts = set(vec![]);
        let now = Utc::now();
        let dk = DenominationKey {
            key_hash: crate::types::HashCode([1u8; 32]),
            expire_deposit: now - Duration::seconds(1),
        };
        assert_eq!(
            ts.check_denomination(&dk, true, &[], now),
            DenominationVerdict::Expired
        );
    }

    #[test]
    fn trusted_exchange_accepts_unexpired_denomination_without_vouch() {
        let ts = set(vec![]);
        let now = Utc::now();
        let dk = DenominationKey {
            key_hash: crate::types::HashCode([1u8; 32]),
            expire_deposit: now + Duration::days(1),
        };
        assert_eq!(
            ts.check_denomination(&dk, true, &[], now),
            DenominationVerdict::Accept
        );
    }

    #[test]
    fn untrusted_exchange_accepted_only_via_matching_auditor_vouch() {
        let pk = [9u8; 32];
        let ts = set(vec![auditor(pk)]);
        let now = Utc::now();
        let denom_hash = crate::types::HashCode([1u8; 32]);
        let dk = DenominationKey {
            key_hash: denom_hash,
            expire_deposit: now + Duration::days(1),
        };

        let no_vouch = ts.check_denomination(&dk, false, &[], now);
        assert_eq!(no_vouch, DenominationVerdict::Untrusted);

        let vouches = vec![AuditorVouch {
            auditor_pub: crate::types::HashCode(pk),
            denom_key_hash: denom_hash,
        }];
        let with_vouch = ts.check_denomination(&dk, false, &vouches, now);
        assert_eq!(with_vouch, DenominationVerdict::Accept);
    }

    #[test]
    fn vouch_from_untrusted_auditor_does_not_count() {
        let ts = set(vec![auditor([9u8; 32])]);
        let now = Utc::now();
        let denom_hash = crate::types::HashCode([1u8; 32]);
        let dk = DenominationKey {
            key_hash: denom_hash,
            expire_deposit: now + Duration::days(1),
        };
        let vouches = vec![AuditorVouch {
            auditor_pub: crate::types::HashCode([2u8; 32]),
            denom_key_hash: denom_hash,
        }];
        assert_eq!(
            ts.check_denomination(&dk, false, &vouches, now),
            DenominationVerdict::Untrusted
        );
    }
}
