//! ES256 JSON Web Signatures over ACME request payloads.
//!
//! See [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use eyre::{eyre, WrapErr as _};
use p256::ecdsa::{signature::Signer as _, Signature};
use serde::Serialize;
use sha2::{Digest as _, Sha256};

use super::key::AccountKey;

/// Protected header of every request.
///
/// newAccount requests carry the public key (`jwk`); all later requests carry the account URL
/// (`kid`). The two are mutually exclusive.
#[derive(Debug, Serialize)]
struct ProtectedHeader<'a> {
    alg: &'static str,
    nonce: String,
    url: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

/// Public half of an account key.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub(crate) struct Jwk {
    alg: &'static str,
    crv: &'static str,
    kty: &'static str,
    #[serde(rename = "use")]
    _use: &'static str,
    x: String,
    y: String,
}

impl TryFrom<&AccountKey> for Jwk {
    type Error = eyre::Error;

    fn try_from(key: &AccountKey) -> eyre::Result<Self> {
        let point = key.signing_key().verifying_key().to_encoded_point(false);

        let x = point.x().ok_or_else(|| eyre!("public key has no x coordinate"))?;
        let y = point.y().ok_or_else(|| eyre!("public key has no y coordinate"))?;

        Ok(Jwk {
            alg: "ES256",
            crv: "P-256",
            kty: "EC",
            _use: "sig",
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
        })
    }
}

/// Members of the JWK that go into the RFC 7638 thumbprint.
// LEXICAL ORDER OF FIELDS MATTER!
#[derive(Debug, Serialize)]
struct JwkThumb<'a> {
    crv: &'a str,
    kty: &'a str,
    x: &'a str,
    y: &'a str,
}

impl<'a> From<&'a Jwk> for JwkThumb<'a> {
    fn from(jwk: &'a Jwk) -> Self {
        JwkThumb {
            crv: jwk.crv,
            kty: jwk.kty,
            x: &jwk.x,
            y: &jwk.y,
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize)]
struct FlattenedJws {
    protected: String,
    payload: String,
    signature: String,
}

/// How the signer identifies itself in the protected header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyRef {
    Jwk,
    Kid,
}

/// Signs `payload` for `url` and returns the flattened JSON serialization.
pub(crate) fn sign<T: Serialize + ?Sized>(
    key: &AccountKey,
    key_ref: KeyRef,
    url: &str,
    nonce: String,
    payload: &T,
) -> eyre::Result<String> {
    let (jwk, kid) = match key_ref {
        KeyRef::Jwk => (Some(Jwk::try_from(key)?), None),
        KeyRef::Kid => (None, Some(key.key_id()?)),
    };

    let protected = ProtectedHeader {
        alg: "ES256",
        nonce,
        url,
        jwk,
        kid,
    };

    let protected = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(&protected)?);

    let payload = {
        let payload_json = serde_json::to_string(payload)?;

        // POST-as-GET sends an empty payload rather than an encoded empty string
        if payload_json == "\"\"" {
            String::new()
        } else {
            BASE64_URL_SAFE_NO_PAD.encode(payload_json)
        }
    };

    let to_sign = format!("{protected}.{payload}");
    let signature: Signature = key
        .signing_key()
        .try_sign(to_sign.as_bytes())
        .wrap_err("signing request")?;

    let jws = FlattenedJws {
        protected,
        payload,
        signature: BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    };

    Ok(serde_json::to_string(&jws)?)
}

/// Key authorization for a challenge token: `token || '.' || base64url(thumbprint(jwk))`.
///
/// See [RFC 8555 §8.1](https://datatracker.ietf.org/doc/html/rfc8555#section-8.1).
pub(crate) fn key_authorization(token: &str, key: &AccountKey) -> eyre::Result<String> {
    let jwk = Jwk::try_from(key)?;
    let thumb = serde_json::to_string(&JwkThumb::from(&jwk))?;
    let digest = BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(thumb));

    Ok(format!("{token}.{digest}"))
}

/// TXT record value for a `dns-01` challenge.
///
/// See [RFC 8555 §8.4](https://datatracker.ietf.org/doc/html/rfc8555#section-8.4).
pub(crate) fn dns_txt_value(key_authorization: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization))
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::{signature::Verifier as _, VerifyingKey};

    use super::*;
    use crate::acme::api::EmptyString;

    fn decode_json(part: &str) -> serde_json::Value {
        let bytes = BASE64_URL_SAFE_NO_PAD.decode(part).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_sign_with_jwk() {
        let key = AccountKey::generate();
        let payload = serde_json::json!({ "termsOfServiceAgreed": true });
        let jws = sign(
            &key,
            KeyRef::Jwk,
            "https://ca.test/new-acct",
            "n0nce".to_owned(),
            &payload,
        )
        .unwrap();

        let jws: serde_json::Value = serde_json::from_str(&jws).unwrap();
        let protected = decode_json(jws["protected"].as_str().unwrap());

        assert_eq!(protected["alg"], "ES256");
        assert_eq!(protected["nonce"], "n0nce");
        assert_eq!(protected["url"], "https://ca.test/new-acct");
        assert_eq!(protected["jwk"]["crv"], "P-256");
        assert!(protected.get("kid").is_none());

        let payload = decode_json(jws["payload"].as_str().unwrap());
        assert_eq!(payload["termsOfServiceAgreed"], true);

        // the signature covers "<protected>.<payload>"
        let signed = format!(
            "{}.{}",
            jws["protected"].as_str().unwrap(),
            jws["payload"].as_str().unwrap()
        );
        let sig_bytes = BASE64_URL_SAFE_NO_PAD
            .decode(jws["signature"].as_str().unwrap())
            .unwrap();
        let signature = Signature::from_slice(&sig_bytes).unwrap();
        let verifying_key: &VerifyingKey = key.signing_key().verifying_key();
        verifying_key.verify(signed.as_bytes(), &signature).unwrap();
    }

    #[test]
    fn test_sign_post_as_get_with_kid() {
        let url = "https://ca.test/order/1";
        let mut key = AccountKey::generate();
        assert!(sign(&key, KeyRef::Kid, url, "n".to_owned(), &EmptyString).is_err());

        key.set_key_id("https://ca.test/acct/1".to_owned());
        let jws = sign(&key, KeyRef::Kid, url, "n".to_owned(), &EmptyString).unwrap();

        let jws: serde_json::Value = serde_json::from_str(&jws).unwrap();
        let protected = decode_json(jws["protected"].as_str().unwrap());

        assert_eq!(protected["kid"], "https://ca.test/acct/1");
        assert!(protected.get("jwk").is_none());
        assert_eq!(jws["payload"], "");
    }

    #[test]
    fn test_key_authorization_shape() {
        let key = AccountKey::generate();
        let key_auth = key_authorization("tok3n", &key).unwrap();

        let (token, thumbprint) = key_auth.split_once('.').unwrap();
        assert_eq!(token, "tok3n");
        // base64url of a SHA-256 digest
        assert_eq!(thumbprint.len(), 43);

        // stable for the same key
        assert_eq!(key_auth, key_authorization("tok3n", &key).unwrap());

        let txt = dns_txt_value(&key_auth);
        assert_eq!(txt.len(), 43);
        assert_ne!(txt, thumbprint);
    }
}
