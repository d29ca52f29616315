//! Embedded login exchange.
//!
//! The opener sends its credentials as `Login`-tagged stream data. The
//! acceptor answers with a [`LoginResponse`] encoded with bincode, also
//! tagged `Login`. Both travel through the ordinary reliability engine.

use bincode::error::EncodeError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolViolation;

/// Acceptor's verdict on a login request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub accepted: bool,
    pub text: String,
}

impl LoginResponse {
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            text: "Login accepted.".to_owned(),
        }
    }

    /// Encode the response for transmission.
    ///
    /// # Errors
    ///
    /// Returns any [`EncodeError`] raised by bincode.
    pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map(Bytes::from)
    }

    /// Decode a response received from the acceptor.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolViolation::MalformedLogin`] if the payload is not a
    /// complete response.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolViolation> {
        let (response, used): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|err| ProtocolViolation::MalformedLogin(err.to_string()))?;
        if used != bytes.len() {
            return Err(ProtocolViolation::MalformedLogin(format!(
                "{} trailing bytes",
                bytes.len() - used
            )));
        }
        Ok(response)
    }
}
