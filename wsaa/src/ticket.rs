// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Login tickets and the response document they're issued in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::Error, xml};

/// A login ticket issued by WSAA.
///
/// The `sign` and `token` pair authenticates calls to the service the ticket was issued for,
/// up to and including `expiration_time`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub sign: String,
    pub token: String,
    pub expiration_time: DateTime<Utc>,
}

// The sign and token are bearer credentials; keep them out of logs.
impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("sign", &"<redacted>")
            .field("token", &"<redacted>")
            .field("expiration_time", &self.expiration_time)
            .finish()
    }
}

impl Ticket {
    /// Returns true if the ticket may still be used at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.expiration_time
    }

    /// Returns true if the ticket may still be used.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// The authentication triple downstream web services (WSFE, WSCDC, etc.) expect in
    /// each request on behalf of the taxpayer identified by `cuit`.
    pub fn authorization(&self, cuit: u64) -> Authorization {
        Authorization {
            cuit,
            sign: self.sign.clone(),
            token: self.token.clone(),
        }
    }
}

/// Credentials attached to calls made to WSAA-protected services.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub cuit: u64,
    pub sign: String,
    pub token: String,
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorization")
            .field("cuit", &self.cuit)
            .finish_non_exhaustive()
    }
}

/// The `loginTicketResponse` document returned by `loginCms`.
#[derive(Debug, Clone)]
pub struct LoginResponse {
    /// The distinguished name of the issuing authority, if present.
    pub source: Option<String>,
    /// The distinguished name of the certificate the ticket was issued to, if present.
    pub destination: Option<String>,
    /// Echo of the request's `uniqueId`.
    pub request_id: u32,
    pub generation_time: DateTime<Utc>,
    pub ticket: Ticket,
}

impl LoginResponse {
    /// Parse the response document.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] is returned if the document is not well-formed or any of
    /// `uniqueId`, `generationTime`, `expirationTime`, `token`, or `sign` is missing or invalid.
    pub fn from_xml(document: &str) -> Result<Self, Error> {
        let field = |name: &str| xml::required_text(document, name).map_err(Error::Protocol);
        let optional = |name: &str| xml::element_text(document, name).map_err(Error::Protocol);
        let credential = |name: &str| {
            let value = field(name)?;
            if value.trim().is_empty() {
                return Err(Error::Protocol(format!("<{name}> is empty")));
            }
            Ok(value)
        };

        let request_id = field("uniqueId")?;
        let request_id = request_id
            .parse()
            .map_err(|_| Error::Protocol(format!("uniqueId '{request_id}' is not a u32")))?;

        Ok(Self {
            source: optional("source")?,
            destination: optional("destination")?,
            request_id,
            generation_time: parse_time("generationTime", &field("generationTime")?)?,
            ticket: Ticket {
                sign: credential("sign")?,
                token: credential("token")?,
                expiration_time: parse_time("expirationTime", &field("expirationTime")?)?,
            },
        })
    }
}

/// Parse an RFC 3339 timestamp, as used throughout WSAA documents.
pub(crate) fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|error| Error::Protocol(format!("{field} '{value}' is invalid: {error}")))
}
