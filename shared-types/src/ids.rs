//! Opaque identifiers for grains, packages, and apps.
//!
//! Text-form encodings are load-bearing: they appear in directory names,
//! hostnames, and signed package headers, so every parse/format pair here
//! round-trips exactly as required by the id invariants.

use std::fmt;

pub const APP_ID_BYTE_SIZE: usize = 32;
pub const PACKAGE_ID_BYTE_SIZE: usize = 16;
pub const APP_ID_TEXT_SIZE: usize = 52;
pub const PACKAGE_ID_TEXT_SIZE: usize = 32;

/// The 32-character alphabet used for AppId text form. Deliberately excludes
/// `b`, `i`, `l`, `o` — those are accepted on parse only as aliases.
const APP_ID_ALPHABET: &[u8; 32] = b"0123456789acdefghjkmnpqrstuvwxyz";

fn app_id_alphabet_index(c: char) -> Option<u8> {
    let c = c.to_ascii_lowercase();
    let aliased = match c {
        'o' => '0',
        'i' | 'l' => '1',
        'b' => '8',
        other => other,
    };
    APP_ID_ALPHABET
        .iter()
        .position(|&b| b as char == aliased)
        .map(|i| i as u8)
}

/// Case-sensitive identifier naming `<data-root>/grains/<GrainId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct GrainId(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GrainIdError {
    #[error("grain id must be at least 8 characters")]
    TooShort,
    #[error("grain id must not contain '/'")]
    ContainsSlash,
    #[error("grain id must not start with '.'")]
    LeadingDot,
}

impl GrainId {
    pub fn parse(s: &str) -> Result<Self, GrainIdError> {
        if s.len() < 8 {
            return Err(GrainIdError::TooShort);
        }
        if s.contains('/') {
            return Err(GrainIdError::ContainsSlash);
        }
        if s.starts_with('.') {
            return Err(GrainIdError::LeadingDot);
        }
        Ok(GrainId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 16-byte content-derived package identity. Text form is 32 lowercase hex
/// characters, naming `<data-root>/apps/<PackageId>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PackageId([u8; PACKAGE_ID_BYTE_SIZE]);

impl PackageId {
    pub fn from_bytes(bytes: [u8; PACKAGE_ID_BYTE_SIZE]) -> Self {
        PackageId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PACKAGE_ID_BYTE_SIZE] {
        &self.0
    }

    pub fn to_text(&self) -> String {
        hex::encode(self.0)
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        if s.len() != PACKAGE_ID_TEXT_SIZE {
            return None;
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let decoded = hex::decode(s).ok()?;
        let arr: [u8; PACKAGE_ID_BYTE_SIZE] = decoded.try_into().ok()?;
        Some(PackageId(arr))
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// 32-byte Ed25519 public key identifying the app that signs all its
/// packages. Text form is 52 base32 characters in a custom alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AppId([u8; APP_ID_BYTE_SIZE]);

impl AppId {
    pub fn from_bytes(bytes: [u8; APP_ID_BYTE_SIZE]) -> Self {
        AppId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; APP_ID_BYTE_SIZE] {
        &self.0
    }

    pub fn to_text(&self) -> String {
        // 256 bits packed 5 bits/char = 52 chars with 4 trailing zero bits.
        let mut bits: u64 = 0;
        let mut bit_count = 0u32;
        let mut out = String::with_capacity(APP_ID_TEXT_SIZE);
        for &byte in self.0.iter() {
            bits = (bits << 8) | byte as u64;
            bit_count += 8;
            while bit_count >= 5 {
                bit_count -= 5;
                let idx = ((bits >> bit_count) & 0x1f) as usize;
                out.push(APP_ID_ALPHABET[idx] as char);
            }
        }
        if bit_count > 0 {
            let idx = ((bits << (5 - bit_count)) & 0x1f) as usize;
            out.push(APP_ID_ALPHABET[idx] as char);
        }
        debug_assert_eq!(out.len(), APP_ID_TEXT_SIZE);
        out
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        if s.chars().count() != APP_ID_TEXT_SIZE {
            return None;
        }

        let mut bits: u64 = 0;
        let mut bit_count = 0u32;
        let mut out = [0u8; APP_ID_BYTE_SIZE];
        let mut out_idx = 0usize;
        let mut trailing_value: u64 = 0;
        let mut trailing_bits: u32 = 0;

        for (i, c) in s.chars().enumerate() {
            let val = app_id_alphabet_index(c)? as u64;
            bits = (bits << 5) | val;
            bit_count += 5;
            if i == APP_ID_TEXT_SIZE - 1 {
                // Last symbol only contributes 4 usable bits (260 - 256); the
                // low bit must be zero or the id is malformed.
                trailing_value = val;
                trailing_bits = bit_count % 8;
            }
            while bit_count >= 8 {
                bit_count -= 8;
                if out_idx >= APP_ID_BYTE_SIZE {
                    // Extra full byte beyond the 32 we need: only acceptable
                    // if it's exactly the zero-padding tail.
                    let extra = (bits >> bit_count) & 0xff;
                    if extra != 0 {
                        return None;
                    }
                    continue;
                }
                out[out_idx] = ((bits >> bit_count) & 0xff) as u8;
                out_idx += 1;
            }
        }

        if out_idx != APP_ID_BYTE_SIZE {
            return None;
        }
        // Reject non-zero trailing bits (the 4 padding bits of the last symbol).
        let padding_mask = (1u64 << trailing_bits) - 1;
        if trailing_bits > 0 && (trailing_value & padding_mask) != 0 {
            return None;
        }

        Some(AppId(out))
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grain_id_rejects_short_ids() {
        assert_eq!(GrainId::parse("short"), Err(GrainIdError::TooShort));
    }

    #[test]
    fn grain_id_rejects_slash_and_leading_dot() {
        assert_eq!(GrainId::parse("has/slash12"), Err(GrainIdError::ContainsSlash));
        assert_eq!(GrainId::parse(".hidden12"), Err(GrainIdError::LeadingDot));
    }

    #[test]
    fn grain_id_accepts_valid() {
        assert!(GrainId::parse("abcdefgh").is_ok());
    }

    #[test]
    fn package_id_round_trips() {
        let bytes = [0xABu8; PACKAGE_ID_BYTE_SIZE];
        let id = PackageId::from_bytes(bytes);
        let text = id.to_text();
        assert_eq!(text.len(), PACKAGE_ID_TEXT_SIZE);
        assert_eq!(PackageId::try_parse(&text), Some(id));
    }

    #[test]
    fn package_id_rejects_wrong_length() {
        assert_eq!(PackageId::try_parse("ab"), None);
    }

    #[test]
    fn app_id_round_trips_for_arbitrary_bytes() {
        for seed in 0u8..8 {
            let mut bytes = [0u8; APP_ID_BYTE_SIZE];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = seed.wrapping_mul(31).wrapping_add(i as u8);
            }
            let id = AppId::from_bytes(bytes);
            let text = id.to_text();
            assert_eq!(text.len(), APP_ID_TEXT_SIZE);
            assert_eq!(AppId::try_parse(&text), Some(id), "seed={seed}");
        }
    }

    #[test]
    fn app_id_parse_accepts_case_folding_and_aliases() {
        let id = AppId::from_bytes([0x42; APP_ID_BYTE_SIZE]);
        let text = id.to_text();
        let upper = text.to_uppercase();
        assert_eq!(AppId::try_parse(&upper), Some(id));

        // Swap an 'a' for an alias character and confirm it still parses to
        // something (alias substitution only matters when the aliased char
        // is actually present in canonical output; we just check no-panic
        // plus correct alphabet membership influence via round-trip above).
        let with_oil_aliases: String = text
            .chars()
            .map(|c| if c == '0' { 'o' } else { c })
            .collect();
        assert!(AppId::try_parse(&with_oil_aliases).is_some());
    }

    #[test]
    fn app_id_rejects_wrong_length() {
        assert_eq!(AppId::try_parse("tooshort"), None);
    }

    #[test]
    fn app_id_rejects_nonzero_trailing_bits() {
        // Only 256 of the 260 encoded bits are real data; the final symbol's
        // low 4 bits are always zero padding. Valid terminal symbols are
        // therefore only '0' or 'h' — anything else must be rejected.
        let id = AppId::from_bytes([0xFF; APP_ID_BYTE_SIZE]);
        let mut text = id.to_text();
        assert!(text.ends_with('0') || text.ends_with('h'));
        text.pop();
        text.push('1'); // alphabet index 1 -> low bits nonzero
        assert_eq!(AppId::try_parse(&text), None);
    }
}
