// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Building the login ticket request (`loginTicketRequest`) submitted to WSAA.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

use crate::{error::Error, ticket::parse_time, xml};

/// How many minutes the request's validity window extends either side of the current time.
///
/// Backdating the generation time tolerates a client clock that runs ahead of the
/// authority's.
pub const REQUEST_WINDOW_MINUTES: i64 = 10;

/// Source of the `uniqueId` values for login ticket requests.
///
/// The authority rejects requests it considers replays, so every request this process
/// builds gets its own identifier. Identifiers are not persisted and restart from 1 with the
/// process.
#[derive(Debug, Default)]
pub struct RequestCounter(AtomicU32);

impl RequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next request identifier.
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// Reject service names no request can be built for.
pub(crate) fn check_service(service: &str) -> Result<(), Error> {
    if service.trim().is_empty() {
        return Err(Error::InvalidArgument(
            "the service name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// A request for a login ticket granting access to `service`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub request_id: u32,
    pub generation_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    /// The name of the web service the ticket is for (e.g. "wsfe").
    pub service: String,
}

impl LoginRequest {
    /// Build a request for `service` valid from ten minutes ago until ten minutes from now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `service` is empty.
    pub fn build(service: &str, request_id: u32) -> Result<Self, Error> {
        Self::build_at(service, request_id, Utc::now())
    }

    /// Like [`LoginRequest::build`], but with the validity window centered on `now`.
    pub fn build_at(service: &str, request_id: u32, now: DateTime<Utc>) -> Result<Self, Error> {
        check_service(service)?;

        let window = TimeDelta::minutes(REQUEST_WINDOW_MINUTES);
        Ok(Self {
            request_id,
            generation_time: now - window,
            expiration_time: now + window,
            service: service.to_string(),
        })
    }

    /// Serialize the request to the document that gets signed.
    pub fn to_xml(&self) -> String {
        format!(
            "<loginTicketRequest version=\"1.0\">\
                <header>\
                    <uniqueId>{}</uniqueId>\
                    <generationTime>{}</generationTime>\
                    <expirationTime>{}</expirationTime>\
                </header>\
                <service>{}</service>\
            </loginTicketRequest>",
            self.request_id,
            self.generation_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.expiration_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            quick_xml::escape::escape(self.service.as_str()),
        )
    }

    /// Parse a request document, as produced by [`LoginRequest::to_xml`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the document is malformed or lacks a field.
    pub fn from_xml(document: &str) -> Result<Self, Error> {
        let field = |name: &str| xml::required_text(document, name).map_err(Error::Protocol);

        let request_id = field("uniqueId")?;
        let request_id = request_id
            .parse()
            .map_err(|_| Error::Protocol(format!("uniqueId '{request_id}' is not a u32")))?;

        Ok(Self {
            request_id,
            generation_time: parse_time("generationTime", &field("generationTime")?)?,
            expiration_time: parse_time("expirationTime", &field("expirationTime")?)?,
            service: field("service")?,
        })
    }
}
