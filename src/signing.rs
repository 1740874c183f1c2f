//! Signed report-link tokens: base64url(json || b':' || hmac_sha256(secret, json)).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportToken {
    pub login: String,
    pub date: NaiveDate,
}

pub fn sign(payload: &ReportToken, secret: &[u8]) -> String {
    let json = serde_json::to_vec(payload).expect("ReportToken always serializes");
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&json);
    let tag = mac.finalize().into_bytes();

    let mut body = json;
    body.push(b':');
    body.extend_from_slice(&tag);
    URL_SAFE_NO_PAD.encode(body)
}

pub fn unsign(token: &str, secret: &[u8]) -> Option<ReportToken> {
    let raw = URL_SAFE_NO_PAD.decode(token).ok()?;
    let split_at = raw.iter().rposition(|&b| b == b':')?;
    let (json, rest) = raw.split_at(split_at);
    let tag = &rest[1..];

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(json);
    mac.verify_slice(tag).ok()?;

    serde_json::from_slice(json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_payload() {
        let secret = b"a-secret-that-is-long-enough";
        let payload = ReportToken {
            login: "u1".to_owned(),
            date: NaiveDate::from_ymd_opt(2026, 7, 30).unwrap(),
        };
        let token = sign(&payload, secret);
        assert_eq!(unsign(&token, secret), Some(payload));
    }

    #[test]
    fn rejects_any_tampered_byte() {
        let secret = b"a-secret-that-is-long-enough";
        let payload = ReportToken {
            login: "u1".to_owned(),
            date: NaiveDate::from_ymd_opt(2026, 7, 30).unwrap(),
        };
        let token = sign(&payload, secret);
        let mut bytes: Vec<u8> = token.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = String::from_utf8(bytes).unwrap();
        assert_eq!(unsign(&tampered, secret), None);
    }

    #[test]
    fn rejects_wrong_secret() {
        let payload = ReportToken {
            login: "u1".to_owned(),
            date: NaiveDate::from_ymd_opt(2026, 7, 30).unwrap(),
        };
        let token = sign(&payload, b"secret-one-is-long-enough");
        assert_eq!(unsign(&token, b"secret-two-is-long-enough"), None);
    }
}
