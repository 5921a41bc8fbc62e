#![allow(dead_code)]

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A currency-tagged fixed-point amount: `value` whole units plus `fraction`
/// in 1e-8ths, matching the wire encoding exchanges and wallets exchange
/// amounts in (`"CUR:12.50000000"`-shaped strings, parsed once at the edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub currency: [u8; 12],
    pub currency_len: u8,
    pub value: u64,
    pub fraction: u32,
}

const FRACTION_BASE: u64 = 100_000_000;

impl Amount {
    pub fn new(currency: &str, value: u64, fraction: u32) -> Result<Self> {
        if currency.len() > 12 || currency.is_empty() {
            return Err(eyre!("currency code must be 1-12 bytes, got {:?}", currency));
        }
        if fraction as u64 >= FRACTION_BASE {
            return Err(eyre!("fraction {} out of range", fraction));
        }
        let mut bytes = [0u8; 12];
        bytes[..currency.len()].copy_from_slice(currency.as_bytes());
        Ok(Self {
            currency: bytes,
            currency_len: currency.len() as u8,
            value,
            fraction,
        })
    }

    pub fn zero(currency: &str) -> Result<Self> {
        Self::new(currency, 0, 0)
    }

    pub fn currency(&self) -> &str {
        std::str::from_utf8(&self.currency[..self.currency_len as usize]).unwrap_or("")
    }

    fn same_currency(&self, other: &Amount) -> Result<()> {
        if self.currency() != other.currency() {
            return Err(eyre!(
                "currency mismatch: {} vs {}",
                self.currency(),
                other.currency()
            ));
        }
        Ok(())
    }

    /// Total value in 1e-8th units, used for arithmetic that needs a single integer.
    fn total_units(&self) -> u128 {
        self.value as u128 * FRACTION_BASE as u128 + self.fraction as u128
    }

    fn from_units(currency: &str, units: u128) -> Result<Self> {
        let value = (units / FRACTION_BASE as u128) as u64;
        let fraction = (units % FRACTION_BASE as u128) as u32;
        Self::new(currency, value, fraction)
    }

    pub fn checked_add(&self, other: &Amount) -> Result<Amount> {
        self.same_currency(other)?;
        Self::from_units(self.currency(), self.total_units() + other.total_units())
    }

    /// Saturating difference: `self - other`, floored at zero.
    pub fn saturating_sub(&self, other: &Amount) -> Result<Amount> {
        self.same_currency(other)?;
        let a = self.total_units();
        let b = other.total_units();
        Self::from_units(self.currency(), a.saturating_sub(b))
    }

    /// Checked difference; errors if `other > self`.
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount> {
        self.same_currency(other)?;
        let a = self.total_units();
        let b = other.total_units();
        if b > a {
            return Err(eyre!("amount underflow: {} - {}", self, other));
        }
        Self::from_units(self.currency(), a - b)
    }

    /// Integer division by a positive divisor, per spec §4.5.4's
    /// "integer-division semantics on the amount type".
    pub fn checked_div(&self, divisor: u32) -> Result<Amount> {
        if divisor == 0 {
            return Err(eyre!("division by zero"));
        }
        Self::from_units(self.currency(), self.total_units() / divisor as u128)
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.fraction == 0
    }
}

impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Amount) -> Option<Ordering> {
        if self.currency() != other.currency() {
            return None;
        }
        Some(self.total_units().cmp(&other.total_units()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{:08}", self.currency(), self.value, self.fraction)
    }
}

impl std::str::FromStr for Amount {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (currency, rest) = s
            .split_once(':')
            .ok_or_else(|| eyre!("amount {:?} missing currency separator", s))?;
        let (value_str, fraction_str) = rest.split_once('.').unwrap_or((rest, "0"));
        let value: u64 = value_str
            .parse()
            .map_err(|_| eyre!("amount {:?} has invalid integer part", s))?;
        let mut frac_digits = fraction_str.to_string();
        frac_digits.truncate(8);
        while frac_digits.len() < 8 {
            frac_digits.push('0');
        }
        let fraction: u32 = frac_digits
            .parse()
            .map_err(|_| eyre!("amount {:?} has invalid fractional part", s))?;
        Amount::new(currency, value, fraction)
    }
}

/// A 32-byte domain identifier: coin public keys, contract-terms hashes,
/// H_wire, wire-transfer identifiers. Base32-encoded on the wire (Crockford
/// alphabet via `data-encoding`), matching how the source system encodes
/// binary identifiers in JSON.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HashCode(pub [u8; 32]);

impl HashCode {
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
        Self::from_slice(&bytes)
    }

    pub fn from_base32(s: &str) -> Result<Self> {
        let bytes = data_encoding::BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|e| eyre!("invalid base32 hash: {e}"))?;
        Self::from_slice(&bytes)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(eyre!("HashCode must be 32 bytes, got {}", bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(HashCode(out))
    }

    pub fn to_base32(&self) -> String {
        data_encoding::BASE32_NOPAD.encode(&self.0).to_ascii_lowercase()
    }
}

impl TryFrom<String> for HashCode {
    type Error = eyre::Error;
    fn try_from(s: String) -> Result<Self> {
        Self::from_base32(&s)
    }
}

impl From<HashCode> for String {
    fn from(h: HashCode) -> String {
        h.to_base32()
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashCode({})", self.to_base32())
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base32())
    }
}

/// The wire-transfer identifier an exchange attaches to an aggregated payout.
pub type Wtid = HashCode;

/// A coin's public key, as presented by the wallet.
pub type CoinPublicKey = HashCode;

/// An EdDSA signature (64 bytes, Ed25519).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(eyre!("Signature must be 64 bytes, got {}", bytes.len()));
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(bytes);
        Ok(Signature(out))
    }
}

impl TryFrom<String> for Signature {
    type Error = eyre::Error;
    fn try_from(s: String) -> Result<Self> {
        let bytes = data_encoding::BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|e| eyre!("invalid base32 signature: {e}"))?;
        Self::from_bytes(&bytes)
    }
}

impl From<Signature> for String {
    fn from(s: Signature) -> String {
        data_encoding::BASE32_NOPAD.encode(&s.0).to_ascii_lowercase()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(..)")
    }
}

/// A merchant or coin Ed25519 public key (32 bytes).
pub type PublicKey32 = HashCode;

/// Purposes an EdDSA signature can be created for, per spec §4.4/§4.5.6/§4.5.2.
/// Mirrors the source's purpose-tagged signing so a signature can never be
/// replayed across contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SignaturePurpose {
    MerchantContract = 1101,
    MerchantPaymentOk = 1102,
    MerchantRefund = 1103,
    MerchantPaySession = 1104,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_roundtrip_display_parse() {
        let a = Amount::new("CUR", 5, 10_000_000).unwrap();
        let s = a.to_string();
        let parsed: Amount = s.parse().unwrap();
        assert_eq!(a, parsed);
    }

    #[test]
    fn amount_add_and_sub() {
        let a = Amount::new("CUR", 3, 0).unwrap();
        let b = Amount::new("CUR", 2, 0).unwrap();
        let sum = a.checked_add(&b).unwrap();
        assert_eq!(sum, Amount::new("CUR", 5, 0).unwrap());
        let diff = sum.checked_sub(&a).unwrap();
        assert_eq!(diff, b);
    }

    #[test]
    fn amount_sub_underflow_errors() {
        let a = Amount::new("CUR", 1, 0).unwrap();
        let b = Amount::new("CUR", 2, 0).unwrap();
        assert!(a.checked_sub(&b).is_err());
    }

    #[test]
    fn amount_div_is_integer_division() {
        // 0.065 CUR wanted in scenario 2; wire_fee_excess = 0.18 - 0.05 = 0.13,
        // amortization 2 -> 0.065 exactly divides, but verify floor behavior too.
        let a = Amount::new("CUR", 0, 13_000_000).unwrap();
        let half = a.checked_div(2).unwrap();
        assert_eq!(half, Amount::new("CUR", 0, 6_500_000).unwrap());

        let odd = Amount::new("CUR", 0, 1).unwrap();
        let floored = odd.checked_div(2).unwrap();
        assert_eq!(floored, Amount::new("CUR", 0, 0).unwrap());
    }

    #[test]
    fn amount_currency_mismatch_errors() {
        let a = Amount::new("CUR", 1, 0).unwrap();
        let b = Amount::new("OTHER", 1, 0).unwrap();
        assert!(a.checked_add(&b).is_err());
        assert_eq!(a.partial_cmp(&b), None);
    }

    #[test]
    fn hashcode_base32_roundtrip() {
        let h = HashCode([7u8; 32]);
        let s = h.to_base32();
        let parsed = HashCode::from_base32(&s).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn hashcode_from_hex() {
        let hex = "00".repeat(32);
        let h = HashCode::from_hex(&hex).unwrap();
        assert_eq!(h.0, [0u8; 32]);
    }

    #[test]
    fn hashcode_wrong_length_errors() {
        assert!(HashCode::from_hex("dead").is_err());
    }
}
