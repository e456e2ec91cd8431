// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Issuing login tickets, reusing cached ones while they remain valid.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    cache::{FileTicketStore, TicketStore},
    config::Config,
    error::{Error, SigningError, TransportError},
    gateway::{AuthGateway, SoapGateway},
    request::{self, LoginRequest, RequestCounter},
    signer::CertificateWithKey,
    ticket::{LoginResponse, Ticket},
};

/// Where the ticket in an [`Issuance`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketSource {
    /// A still-valid ticket was found in the cache; the authority was not contacted.
    Cache,
    /// The authority issued a new ticket.
    Authority,
}

/// The result of a successful issuance.
#[derive(Debug)]
pub struct Issuance {
    pub ticket: Ticket,
    pub source: TicketSource,
    /// Cache failures that did not prevent the issuance, in the order they occurred.
    ///
    /// [`Error::CacheRead`] means the cache could not be consulted, so a new ticket was
    /// requested. [`Error::CacheWrite`] means the ticket is usable but was not cached; the
    /// next issuance for the service will contact the authority, which may refuse because a
    /// valid ticket already exists.
    pub cache_errors: Vec<Error>,
}

/// Obtains login tickets for WSAA-protected services.
///
/// The issuer can be shared between tasks (e.g. in an [`Arc`]). Issuances for the same
/// service are serialized, so concurrent callers wait for the in-flight request and then
/// receive the ticket it cached. Issuances for different services proceed independently.
pub struct TicketIssuer<G, S> {
    config: Arc<Config>,
    gateway: G,
    store: S,
    counter: RequestCounter,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TicketIssuer<SoapGateway, FileTicketStore> {
    /// Create an issuer that submits requests over SOAP and caches tickets in
    /// [`Config::cache_directory`].
    pub fn from_config(config: Config) -> Result<Self, Error> {
        let gateway = SoapGateway::new(config.request_timeout)?;
        let store = FileTicketStore::new(&config.cache_directory);
        Ok(Self::new(config, gateway, store))
    }
}

impl<G: AuthGateway, S: TicketStore> TicketIssuer<G, S> {
    pub fn new(config: Config, gateway: G, store: S) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
            store,
            counter: RequestCounter::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get a ticket for `service`, returning only the ticket.
    ///
    /// See [`TicketIssuer::issue`] for details.
    pub async fn ticket(&self, service: &str) -> Result<Ticket, Error> {
        self.issue(service).await.map(|issuance| issuance.ticket)
    }

    /// Get a ticket for `service`.
    ///
    /// If the cache holds a ticket that hasn't expired it is returned without signing
    /// anything or contacting the authority. Otherwise a new login ticket request is signed
    /// and submitted, and the ticket from the response is cached before being returned.
    ///
    /// # Errors
    ///
    /// The error variant identifies the step that failed; see [`Error`]. A service name that
    /// is empty or can't be used as a cache key is an [`Error::InvalidArgument`]. Failing to
    /// read or write the cache does not fail the issuance and is reported in
    /// [`Issuance::cache_errors`]. Nothing is retried.
    #[tracing::instrument(skip(self))]
    pub async fn issue(&self, service: &str) -> Result<Issuance, Error> {
        request::check_service(service)?;
        self.store
            .check_key(service)
            .map_err(|error| Error::InvalidArgument(error.to_string()))?;

        let lock = self.service_lock(service);
        let _guard = lock.lock().await;

        let mut cache_errors = vec![];
        match self.store.load(service).await {
            Ok(Some(ticket)) if ticket.is_valid_at(Utc::now()) => {
                tracing::debug!(
                    expiration_time = %ticket.expiration_time,
                    "Reusing cached ticket"
                );
                return Ok(Issuance {
                    ticket,
                    source: TicketSource::Cache,
                    cache_errors,
                });
            }
            Ok(Some(ticket)) => {
                tracing::debug!(
                    expiration_time = %ticket.expiration_time,
                    "Cached ticket has expired"
                );
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%error, "Failed to read the ticket cache; requesting a new ticket");
                cache_errors.push(Error::CacheRead(error));
            }
        }

        let request = LoginRequest::build(service, self.counter.next())?;
        let signed_request = self.sign(&request).await?;

        let timeout = self.config.request_timeout;
        let document = tokio::time::timeout(
            timeout,
            self.gateway.submit(&signed_request, self.config.endpoint()),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

        let response = LoginResponse::from_xml(&document)?;
        if response.request_id != request.request_id {
            tracing::warn!(
                request_id = request.request_id,
                response_id = response.request_id,
                "Login ticket response echoed a different uniqueId"
            );
        }
        self.check_lifetime(&response.ticket, Utc::now())?;
        let ticket = response.ticket;

        if let Err(error) = self.store.store(service, &ticket).await {
            tracing::warn!(%error, "Failed to cache the issued ticket");
            cache_errors.push(Error::CacheWrite(error));
        }
        tracing::info!(
            request_id = request.request_id,
            expiration_time = %ticket.expiration_time,
            "Login ticket issued"
        );

        Ok(Issuance {
            ticket,
            source: TicketSource::Authority,
            cache_errors,
        })
    }

    fn service_lock(&self, service: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(service.to_string()).or_default().clone()
    }

    /// Sign the request document and encode it for submission.
    ///
    /// OpenSSL calls block, so the credentials are loaded and used on the blocking pool.
    async fn sign(&self, request: &LoginRequest) -> Result<String, Error> {
        let config = self.config.clone();
        let payload = request.to_xml();
        let signed = tokio::task::spawn_blocking(move || {
            CertificateWithKey::load(&config.credentials)?.sign(payload.as_bytes())
        })
        .await
        .map_err(|error| SigningError::Task(error.to_string()))??;

        Ok(openssl::base64::encode_block(&signed))
    }

    /// Reject tickets that can't be used, or that claim to be valid for implausibly long.
    fn check_lifetime(&self, ticket: &Ticket, now: DateTime<Utc>) -> Result<(), Error> {
        if !ticket.is_valid_at(now) {
            return Err(Error::Protocol(format!(
                "the issued ticket expired at {}",
                ticket.expiration_time
            )));
        }

        let latest = TimeDelta::from_std(self.config.max_ticket_lifetime)
            .ok()
            .and_then(|lifetime| now.checked_add_signed(lifetime));
        match latest {
            Some(latest) if ticket.expiration_time > latest => Err(Error::Protocol(format!(
                "the issued ticket expires at {}, which is more than {:?} from now",
                ticket.expiration_time, self.config.max_ticket_lifetime
            ))),
            _ => Ok(()),
        }
    }
}
