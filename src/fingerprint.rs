//! Stable request fingerprints.
//!
//! A [`Fingerprint`] is the dedup and cache key of a build. It is a SHA-256
//! digest over a canonical encoding of the request:
//!
//! * every field is length-prefixed, so `("ab", "c")` and `("a", "bc")` differ;
//! * maps are walked in key order (`BTreeMap`), so insertion order is irrelevant;
//! * the source content is hashed byte-for-byte;
//! * `requester_id` is not part of the key: two people asking for the same
//!   build share one render.

use crate::request::{BuildRequest, TemplateSelection};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Bumped whenever the canonical encoding changes.
const ENCODING_VERSION: u8 = 1;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of a build request.
    pub fn of_request(request: &BuildRequest) -> Self {
        let mut enc = Encoder::new();
        enc.u8(ENCODING_VERSION);
        enc.u8(request.kind.tag());
        enc.bytes(&request.source_content);
        enc.selection(&request.template);
        Self(enc.finish())
    }

    /// Digest of raw bytes; used for ad-hoc keys and tests.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 16 hex characters; enough to tell jobs apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_digest(s).map(Self)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse 64 hex characters into a 32-byte digest.
pub(crate) fn decode_digest(s: &str) -> Result<[u8; 32], String> {
    let raw = hex::decode(s.trim()).map_err(|e| format!("invalid hex digest '{s}': {e}"))?;
    raw.try_into()
        .map_err(|v: Vec<u8>| format!("digest must be 32 bytes, got {}", v.len()))
}

// ── Canonical encoding ───────────────────────────────────────────────────

struct Encoder {
    hasher: Sha256,
}

impl Encoder {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn u8(&mut self, v: u8) {
        self.hasher.update([v]);
    }

    fn u64(&mut self, v: u64) {
        self.hasher.update(v.to_be_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.u64(b.len() as u64);
        self.hasher.update(b);
    }

    fn str(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }

    fn selection(&mut self, sel: &TemplateSelection) {
        self.str(&sel.layout);
        self.str(&sel.cover);
        self.str(&sel.impose);

        self.u64(sel.boolean_options.len() as u64);
        for (key, value) in &sel.boolean_options {
            self.str(key);
            self.u8(u8::from(*value));
        }

        self.u64(sel.metadata.len() as u64);
        for (key, value) in &sel.metadata {
            self.str(key);
            self.str(value);
        }

        match sel.paper_thickness {
            None => self.u8(0),
            Some(t) => {
                self.u8(1);
                // -0.0 and 0.0 compare equal and must hash equal.
                let t = if t == 0.0 { 0.0 } else { t };
                self.u64(t.to_bits());
            }
        }
    }

    fn finish(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::BuildKind;

    fn request() -> BuildRequest {
        BuildRequest::convert("# Chapter 1\n\nIt was a dark night.", "classic")
    }

    #[test]
    fn identical_requests_share_a_fingerprint() {
        assert_eq!(
            Fingerprint::of_request(&request()),
            Fingerprint::of_request(&request())
        );
    }

    #[test]
    fn map_insertion_order_is_irrelevant() {
        let mut a = request();
        a.template = a
            .template
            .with_option("dropcaps", true)
            .with_option("draft", false)
            .with_metadata("title", "Night")
            .with_metadata("author", "A. Writer");

        let mut b = request();
        b.template = b
            .template
            .with_metadata("author", "A. Writer")
            .with_option("draft", false)
            .with_metadata("title", "Night")
            .with_option("dropcaps", true);

        assert_eq!(Fingerprint::of_request(&a), Fingerprint::of_request(&b));
    }

    #[test]
    fn requester_is_not_part_of_the_key() {
        let a = request().with_requester("alice");
        let b = request().with_requester("bob");
        assert_eq!(Fingerprint::of_request(&a), Fingerprint::of_request(&b));
    }

    #[test]
    fn content_kind_and_template_all_matter() {
        let base = Fingerprint::of_request(&request());

        let mut content = request();
        content.source_content.push(b'!');
        assert_ne!(base, Fingerprint::of_request(&content));

        let mut kind = request();
        kind.kind = BuildKind::Impose;
        assert_ne!(base, Fingerprint::of_request(&kind));

        let mut option = request();
        option.template = option.template.with_option("draft", true);
        assert_ne!(base, Fingerprint::of_request(&option));

        let mut flipped = request();
        flipped.template = flipped.template.with_option("draft", false);
        assert_ne!(
            Fingerprint::of_request(&option),
            Fingerprint::of_request(&flipped)
        );
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let mut a = request();
        a.template.layout = "ab".into();
        a.template.cover = "c".into();
        let mut b = request();
        b.template.layout = "a".into();
        b.template.cover = "bc".into();
        assert_ne!(Fingerprint::of_request(&a), Fingerprint::of_request(&b));
    }

    #[test]
    fn negative_zero_thickness_matches_zero() {
        let mut a = request();
        a.template.paper_thickness = Some(0.0);
        let mut b = request();
        b.template.paper_thickness = Some(-0.0);
        assert_eq!(Fingerprint::of_request(&a), Fingerprint::of_request(&b));

        let mut none = request();
        none.template.paper_thickness = None;
        assert_ne!(Fingerprint::of_request(&a), Fingerprint::of_request(&none));
    }

    #[test]
    fn hex_parse_and_serde() {
        let fp = Fingerprint::of_request(&request());
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(fp.short(), &hex[..16]);
        assert_eq!(hex.parse::<Fingerprint>().unwrap(), fp);

        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{hex}\""));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);

        assert!("abc".parse::<Fingerprint>().is_err());
        assert!("zz".repeat(32).parse::<Fingerprint>().is_err());
    }
}
