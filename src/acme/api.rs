//! JSON payloads exchanged with the ACME API.
//!
//! See [RFC 8555 §7.1](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1).

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

/// Serializes to `""`; the payload of a POST-as-GET request.
pub(crate) struct EmptyString;

impl Serialize for EmptyString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

/// Serializes to `{}`; the payload that asks the server to validate a challenge.
pub(crate) struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// Problem document as defined in [RFC 7807] and used by [RFC 8555 §6.7].
///
/// [RFC 7807]: https://datatracker.ietf.org/doc/html/rfc7807
/// [RFC 8555 §6.7]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.7
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// HTTP status code of the response carrying the problem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    pub(crate) fn new(kind: impl Into<String>, status: Option<u16>, detail: String) -> Self {
        Self {
            _type: kind.into(),
            detail: Some(detail),
            status,
            subproblems: None,
        }
    }

    /// The error name without its `urn:ietf:params:acme:error:` namespace.
    pub fn error_name(&self) -> &str {
        self._type
            .rsplit_once(':')
            .map_or(self._type.as_str(), |(_, name)| name)
    }

    /// Returns true if problem type is "badNonce".
    pub fn is_bad_nonce(&self) -> bool {
        self.error_name() == "badNonce"
    }

    /// Returns true if problem details indicate that JWS verification failed.
    pub fn is_jws_verification_error(&self) -> bool {
        self.error_name() == "malformed"
            && self
                .detail
                .as_deref()
                .is_some_and(|detail| detail == "JWS verification error")
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type),
            _ => write!(f, "{}", self._type),
        }
    }
}

impl std::error::Error for Problem {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

/// Directory object for ACME client self-configuration.
///
/// See [RFC 8555 §7.1.1](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    pub revoke_cert: String,

    #[serde(default)]
    pub key_change: Option<String>,

    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_required: Option<bool>,
}

/// An ACME account resource.
///
/// See [RFC 8555 §7.1.2](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.2).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,
}

impl Account {
    pub fn is_status_valid(&self) -> bool {
        self.status.as_deref() == Some("valid")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub(crate) fn dns(value: &str) -> Self {
        Self {
            _type: "dns".to_owned(),
            value: value.to_owned(),
        }
    }
}

/// See [RFC 8555 §7.1.6](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// An ACME order object.
///
/// See [RFC 8555 §7.1.3](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,

    pub identifiers: Vec<Identifier>,

    #[serde(default, skip_serializing)]
    pub error: Option<Problem>,

    #[serde(default, skip_serializing)]
    pub authorizations: Vec<String>,

    #[serde(default, skip_serializing)]
    pub finalize: String,

    #[serde(default, skip_serializing)]
    pub certificate: Option<String>,
}

impl Order {
    pub(crate) fn for_domain(domain: &str) -> Self {
        Self {
            status: None,
            identifiers: vec![Identifier::dns(domain)],
            error: None,
            authorizations: Vec::new(),
            finalize: String::new(),
            certificate: None,
        }
    }

    pub fn domains(&self) -> Vec<&str> {
        self.identifiers
            .iter()
            .map(|identifier| identifier.value.as_str())
            .collect()
    }

    pub fn is_status(&self, status: OrderStatus) -> bool {
        self.status == Some(status)
    }
}

/// See [RFC 8555 §7.1.6](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// An ACME authorization object.
///
/// See [RFC 8555 §7.1.4](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    /// Returns the challenge of the given type (`http-01`, `dns-01`), if offered.
    pub fn challenge(&self, challenge_type: &str) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c._type == challenge_type)
    }

    /// First error reported on any of the challenges.
    pub fn challenge_error(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }
}

/// See [RFC 8555 §7.1.6](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// An ACME challenge object.
///
/// See [RFC 8555 §7.1.5](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub _type: String,
    pub url: String,
    pub status: ChallengeStatus,
    pub token: String,

    #[serde(default)]
    pub error: Option<Problem>,
}

/// Finalize request carrying the CSR in base64url-encoded DER (not PEM).
///
/// See [RFC 8555 §7.4](https://datatracker.ietf.org/doc/html/rfc8555#section-7.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Finalize {
    pub csr: String,
}
