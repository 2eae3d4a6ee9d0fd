#![expect(
    clippy::module_name_repetitions,
    reason = "AuthTokenChange is carried by socket events and read outside this module"
)]

//! Auth token decoding and the socket's current auth state.

use std::sync::{PoisonError, RwLock};

use base64::Engine as _;
use base64::alphabet::URL_SAFE;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
/// Secret string type that redacts the signed token in debug output.
pub use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decodes the payload segment of a dot-separated signed token.
///
/// Accepts standard and URL-safe base64 with or without padding. Returns `None` for anything
/// that is not a token carrying a non-null JSON payload.
#[must_use]
pub fn extract_auth_token(signed_token: &str) -> Option<Value> {
    let payload = signed_token.split('.').nth(1)?;
    let normalized: String = payload
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    let bytes = LENIENT_URL_SAFE.decode(normalized).ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Null => None,
        token => Some(token),
    }
}

#[derive(Debug)]
struct Authenticated {
    token: Value,
    signed: SecretString,
}

/// A change of the decoded auth token.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct AuthTokenChange {
    pub new: Option<Value>,
    pub old: Option<Value>,
}

/// Decoded token and signed token, always replaced together.
#[derive(Debug, Default)]
pub(crate) struct AuthState {
    current: RwLock<Option<Authenticated>>,
}

impl AuthState {
    /// Replaces both fields. Returns the change when the decoded token differs by value from
    /// the previous one.
    pub(crate) fn replace(&self, next: Option<(Value, String)>) -> Option<AuthTokenChange> {
        let next = next.map(|(token, signed)| Authenticated {
            token,
            signed: SecretString::from(signed),
        });
        let new = next.as_ref().map(|auth| auth.token.clone());

        let previous = std::mem::replace(
            &mut *self.current.write().unwrap_or_else(PoisonError::into_inner),
            next,
        );
        let old = previous.map(|auth| auth.token);

        (new != old).then_some(AuthTokenChange { new, old })
    }

    pub(crate) fn token(&self) -> Option<Value> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|auth| auth.token.clone())
    }

    pub(crate) fn signed_token(&self) -> Option<SecretString> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|auth| auth.signed.clone())
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
