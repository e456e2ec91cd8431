// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for ticket issuance.

use std::time::Duration;

/// Errors [`crate::issuer::TicketIssuer`] may return.
///
/// Each variant corresponds to the step of the issuance that failed. Nothing is retried
/// automatically; the caller decides whether to invoke the issuance again.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The login ticket request could not be built from the provided input.
    ///
    /// Retrying will not help; the input must be fixed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The certificate or private key could not be used to sign the request.
    ///
    /// Retrying is pointless until the credentials are fixed.
    #[error("failed to sign the login ticket request: {0}")]
    Signing(#[from] SigningError),

    /// The authentication service could not be reached, or it refused the request.
    ///
    /// This may be transient, so retrying is reasonable. Some faults, like the authority
    /// reporting a ticket is already issued for the service, will persist until the
    /// previously issued ticket expires.
    #[error("failed to submit the login ticket request: {0}")]
    Transport(#[from] TransportError),

    /// The authentication service responded, but the response was malformed or incomplete.
    ///
    /// Retrying the same request will very likely produce the same response.
    #[error("the login ticket response is invalid: {0}")]
    Protocol(String),

    /// A cached ticket could not be read.
    ///
    /// The issuer falls back to requesting a new ticket and reports this in
    /// [`crate::issuer::Issuance::cache_errors`] rather than failing.
    #[error("failed to read the ticket cache: {0}")]
    CacheRead(CacheError),

    /// A freshly issued ticket could not be cached.
    ///
    /// The issuer still returns the ticket and reports this in
    /// [`crate::issuer::Issuance::cache_errors`].
    #[error("failed to write the ticket cache: {0}")]
    CacheWrite(CacheError),
}

/// Reasons the certificate and private key could not be used.
///
/// The messages never include the text of the underlying OpenSSL errors; those are logged
/// at the debug level instead.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SigningError {
    #[error("unable to read {}: {source}", path.display())]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// The container could not be decoded; this is usually a wrong password.
    #[error("unable to decode the {0}; the password may be incorrect")]
    Decode(&'static str),

    #[error("the credentials do not include a private key")]
    MissingPrivateKey,

    #[error("the credentials do not include a certificate")]
    MissingCertificate,

    #[error("the private key does not match the certificate")]
    KeyMismatch,

    #[error("the certificate is not valid at this time")]
    CertificateNotValid,

    /// OpenSSL refused to produce the signature, e.g. due to the certificate's key usage.
    #[error("the signing operation was rejected")]
    Rejected,

    #[error("the signing task failed: {0}")]
    Task(String),
}

/// Failures while talking to the authentication service.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The HTTP request failed before a response was received.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The request did not complete within the configured timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The service answered with a non-success HTTP status and no SOAP fault.
    #[error("the service responded with HTTP status {0}")]
    Status(u16),

    /// The service answered with a SOAP fault.
    #[error("the service returned a fault ({code}): {message}")]
    Fault { code: String, message: String },
}

/// Errors from a [`crate::cache::TicketStore`].
///
/// The issuer wraps these in [`Error::CacheRead`] or [`Error::CacheWrite`] depending on the
/// operation that failed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize the ticket: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The service name can't be mapped onto a cache entry.
    #[error("'{0}' is not usable as a cache key")]
    InvalidKey(String),

    #[error("the cache task failed: {0}")]
    Task(String),
}
