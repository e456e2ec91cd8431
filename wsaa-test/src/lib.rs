// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Utilities for testing ticket issuance: throwaway signing credentials and an in-process
//! authority that verifies requests the way WSAA does.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Offset, SecondsFormat, TimeDelta, Utc};
use openssl::{
    asn1::Asn1Time,
    hash::MessageDigest,
    nid::Nid,
    pkcs12::Pkcs12,
    pkcs7::{Pkcs7, Pkcs7Flags},
    pkey::{PKey, Private},
    rsa::Rsa,
    stack::Stack,
    symm::Cipher,
    x509::{store::X509StoreBuilder, X509Builder, X509NameBuilder, X509},
};
use secrecy::SecretString;
use wsaa::{
    cache::FileTicketStore,
    config::Config,
    error::{Error, TransportError},
    gateway::AuthGateway,
    request::LoginRequest,
    signer::SigningCredentials,
    TicketIssuer,
};

pub mod keys {
    pub const PKCS12_FILE: &str = "wsaa.p12";
    pub const CERTIFICATE_FILE: &str = "wsaa.crt";
    pub const PRIVATE_KEY_FILE: &str = "wsaa.key";
    pub const PASSWORD: &str = "contraseña-de-prueba";
    pub const SUBJECT: &str = "wsaa-test";
    pub const CUIT: u64 = 20123456789;
}

fn self_signed_certificate(key: &PKey<Private>) -> anyhow::Result<X509> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, keys::SUBJECT)?;
    name.append_entry_by_nid(Nid::SERIALNUMBER, &format!("CUIT {}", keys::CUIT))?;
    let name = name.build();

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(&*Asn1Time::from_unix(Utc::now().timestamp() - 86400)?)?;
    builder.set_not_after(&*Asn1Time::days_from_now(365)?)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Generate an RSA key and self-signed certificate, and write them to `dir` as a
/// password-protected PKCS #12 bundle.
pub fn create_pkcs12_credentials(dir: &Path) -> anyhow::Result<SigningCredentials> {
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;
    let certificate = self_signed_certificate(&key)?;
    let bundle = Pkcs12::builder()
        .name(keys::SUBJECT)
        .pkey(&key)
        .cert(&certificate)
        .build2(keys::PASSWORD)?
        .to_der()?;
    let path = dir.join(keys::PKCS12_FILE);
    std::fs::write(&path, bundle).with_context(|| format!("failed to write {path:?}"))?;

    Ok(SigningCredentials::pkcs12(
        path,
        Some(SecretString::from(keys::PASSWORD.to_string())),
    ))
}

/// Like [`create_pkcs12_credentials`], but write a PEM certificate and an encrypted PEM
/// private key.
pub fn create_pem_credentials(dir: &Path) -> anyhow::Result<SigningCredentials> {
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;
    let certificate_path = dir.join(keys::CERTIFICATE_FILE);
    std::fs::write(&certificate_path, self_signed_certificate(&key)?.to_pem()?)?;
    let key_path = dir.join(keys::PRIVATE_KEY_FILE);
    std::fs::write(
        &key_path,
        key.private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), keys::PASSWORD.as_bytes())?,
    )?;

    Ok(SigningCredentials::pem(
        certificate_path,
        key_path,
        Some(SecretString::from(keys::PASSWORD.to_string())),
    ))
}

/// An in-process stand-in for the WSAA `loginCms` operation.
///
/// Like the real service, it verifies the CMS signature, refuses to issue a second ticket
/// for a service while the first is still valid, and echoes the request's `uniqueId`.
#[derive(Debug)]
pub struct MockAuthority {
    sign: String,
    token: String,
    lifetime: TimeDelta,
    delay: Option<Duration>,
    fault: Option<(String, String)>,
    echo_request_id: bool,
    requests: Mutex<Vec<LoginRequest>>,
    issued: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Default for MockAuthority {
    fn default() -> Self {
        Self {
            sign: "S2lnbmVkIGJ5IHRoZSBtb2NrIGF1dGhvcml0eQ==".to_string(),
            token: "PD94bWwgdmVyc2lvbj0iMS4wIj8+PHNzby8+".to_string(),
            lifetime: TimeDelta::hours(12),
            delay: None,
            fault: None,
            echo_request_id: true,
            requests: Mutex::new(vec![]),
            issued: Mutex::new(HashMap::new()),
        }
    }
}

impl MockAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue tickets with the given sign and token.
    pub fn with_ticket(mut self, sign: &str, token: &str) -> Self {
        self.sign = sign.to_string();
        self.token = token.to_string();
        self
    }

    /// Issue tickets valid for `lifetime`; a negative lifetime issues expired tickets.
    pub fn with_lifetime(mut self, lifetime: TimeDelta) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Wait this long before responding.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Respond to every request with a SOAP fault.
    pub fn with_fault(mut self, code: &str, message: &str) -> Self {
        self.fault = Some((code.to_string(), message.to_string()));
        self
    }

    /// Respond with a `uniqueId` other than the one in the request.
    pub fn with_mismatched_request_id(mut self) -> Self {
        self.echo_request_id = false;
        self
    }

    /// The requests received so far, in the order they arrived.
    pub fn requests(&self) -> Vec<LoginRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn fault(code: &str, message: impl Into<String>) -> Error {
        TransportError::Fault {
            code: code.to_string(),
            message: message.into(),
        }
        .into()
    }

    // Verify the signature using only the certificate embedded in the structure and return
    // the signed request.
    fn verify(signed_request: &str) -> anyhow::Result<LoginRequest> {
        let der = openssl::base64::decode_block(signed_request)?;
        let pkcs7 = Pkcs7::from_der(&der)?;
        let store = X509StoreBuilder::new()?.build();
        let mut content = vec![];
        pkcs7.verify(
            &*Stack::<X509>::new()?,
            &store,
            None,
            Some(&mut content),
            Pkcs7Flags::NOVERIFY,
        )?;
        Ok(LoginRequest::from_xml(&String::from_utf8(content)?)?)
    }

    fn respond(&self, request: &LoginRequest) -> Result<String, Error> {
        let now = Utc::now();
        let expiration_time = now + self.lifetime;
        {
            let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
            if issued
                .get(&request.service)
                .is_some_and(|expiration| now <= *expiration)
            {
                return Err(Self::fault(
                    "ns1:coe.alreadyAuthenticated",
                    "El CEE ya posee un TA valido para el acceso al WSN solicitado",
                ));
            }
            issued.insert(request.service.clone(), expiration_time);
        }

        let request_id = if self.echo_request_id {
            request.request_id
        } else {
            request.request_id.wrapping_add(1000)
        };
        // The real service reports times in Argentina's offset.
        let offset = FixedOffset::west_opt(3 * 3600).unwrap_or_else(|| Utc.fix());
        let timestamp = |time: DateTime<Utc>| {
            time.with_timezone(&offset)
                .to_rfc3339_opts(SecondsFormat::Millis, false)
        };

        Ok(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
            <loginTicketResponse version=\"1.0\">\
                <header>\
                    <source>CN=wsaahomo, O=AFIP, C=AR, SERIALNUMBER=CUIT 33693450239</source>\
                    <destination>SERIALNUMBER=CUIT {}, CN={}</destination>\
                    <uniqueId>{request_id}</uniqueId>\
                    <generationTime>{}</generationTime>\
                    <expirationTime>{}</expirationTime>\
                </header>\
                <credentials><token>{}</token><sign>{}</sign></credentials>\
            </loginTicketResponse>",
            keys::CUIT,
            keys::SUBJECT,
            timestamp(now),
            timestamp(expiration_time),
            self.token,
            self.sign,
        ))
    }
}

impl AuthGateway for MockAuthority {
    async fn submit(&self, signed_request: &str, _endpoint: &str) -> Result<String, Error> {
        let request = Self::verify(signed_request).map_err(|error| {
            tracing::error!(?error, "Mock authority rejected the CMS structure");
            Self::fault("ns1:cms.bad", "Error al verificar el CMS")
        })?;
        tracing::info!(
            request_id = request.request_id,
            service = %request.service,
            "Mock authority received a login ticket request"
        );
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((code, message)) = &self.fault {
            return Err(Self::fault(code, message.as_str()));
        }
        self.respond(&request)
    }
}

// Dropping TempDir cleans up the directory, but it needs to live to the end of the test.
pub struct Instance {
    pub issuer: TicketIssuer<MockAuthority, FileTicketStore>,
    pub state_dir: tempfile::TempDir,
}

impl Instance {
    pub fn authority(&self) -> &MockAuthority {
        self.issuer.gateway()
    }

    pub fn cache_directory(&self) -> &Path {
        &self.issuer.config().cache_directory
    }
}

/// Builder for creating an issuer backed by a [`MockAuthority`].
#[derive(Default)]
pub struct InstanceBuilder {
    authority: MockAuthority,
    with_pem_credentials: bool,
    request_timeout: Option<Duration>,
    max_ticket_lifetime: Option<Duration>,
}

impl InstanceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authority(mut self, authority: MockAuthority) -> Self {
        self.authority = authority;
        self
    }

    /// Use a PEM certificate and key rather than a PKCS #12 bundle.
    pub fn with_pem_credentials(mut self) -> Self {
        self.with_pem_credentials = true;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_max_ticket_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_ticket_lifetime = Some(lifetime);
        self
    }

    pub fn build(self) -> anyhow::Result<Instance> {
        let state_dir = tempfile::TempDir::new()?;
        let credentials_dir = state_dir.path().join("credentials");
        std::fs::create_dir(&credentials_dir)?;
        let credentials = if self.with_pem_credentials {
            create_pem_credentials(&credentials_dir)?
        } else {
            create_pkcs12_credentials(&credentials_dir)?
        };

        let defaults = Config::default();
        let config = Config {
            endpoint: Some("http://wsaa.invalid/ws/services/LoginCms".to_string()),
            cache_directory: state_dir.path().join("cache"),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            max_ticket_lifetime: self
                .max_ticket_lifetime
                .unwrap_or(defaults.max_ticket_lifetime),
            credentials,
            ..defaults
        };
        let store = FileTicketStore::new(&config.cache_directory);

        Ok(Instance {
            issuer: TicketIssuer::new(config, self.authority, store),
            state_dir,
        })
    }
}
