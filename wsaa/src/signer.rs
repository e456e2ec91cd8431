// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Signing login ticket requests.
//!
//! WSAA expects the request document wrapped in a CMS SignedData structure (the `loginCms`
//! operation is named after it) that carries the signer's certificate, but not the rest of
//! its chain.

use std::path::{Path, PathBuf};

use openssl::{
    asn1::Asn1Time,
    cms::{CMSOptions, CmsContentInfo},
    error::ErrorStack,
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    x509::X509,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::SigningError;

/// Where the certificate and private key used to sign requests are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum CertificateSource {
    /// A PKCS #12 bundle (often with a `.pfx` or `.p12` extension) containing both the
    /// certificate and its private key.
    Pkcs12 { path: PathBuf },
    /// A PEM-encoded certificate and a PEM-encoded private key in separate files.
    Pem {
        certificate: PathBuf,
        private_key: PathBuf,
    },
}

/// The credentials used to sign login ticket requests.
///
/// If the paths provided are relative, they can be resolved against a credentials directory
/// with [`SigningCredentials::with_credentials_dir`].
#[derive(Debug, Clone, Serialize)]
pub struct SigningCredentials {
    #[serde(flatten)]
    pub source: CertificateSource,
    /// A file containing the password protecting the private key, if it is encrypted.
    ///
    /// The password must be entirely on the first line of the file. The default settings for
    /// `systemd-ask-password` will produce an acceptable file:
    ///
    /// ```bash
    /// systemd-ask-password | systemd-creds encrypt - /etc/credstore.encrypted/wsaa.certificate_password
    /// ```
    pub password_path: Option<PathBuf>,
    #[serde(skip)]
    password: Option<SecretString>,
}

impl<'de> Deserialize<'de> for SigningCredentials {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct CredentialsHelper {
            #[serde(flatten)]
            source: CertificateSource,
            password_path: Option<PathBuf>,
        }

        let helper = CredentialsHelper::deserialize(deserializer)?;
        let password = helper
            .password_path
            .as_deref()
            .map(read_password)
            .transpose()
            .map_err(serde::de::Error::custom)?;

        Ok(SigningCredentials {
            source: helper.source,
            password_path: helper.password_path,
            password,
        })
    }
}

fn read_password(path: &Path) -> Result<SecretString, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|error| format!("Failed to read password file {}: {error}", path.display()))?;
    let password = contents
        .lines()
        .next()
        .map(str::trim)
        .filter(|password| !password.is_empty())
        .ok_or_else(|| {
            format!(
                "Password file {} does not contain a password on the first line",
                path.display()
            )
        })?;

    Ok(SecretString::from(password.to_string()))
}

impl SigningCredentials {
    /// Credentials stored in a PKCS #12 bundle.
    pub fn pkcs12(path: impl Into<PathBuf>, password: Option<SecretString>) -> Self {
        Self {
            source: CertificateSource::Pkcs12 { path: path.into() },
            password_path: None,
            password,
        }
    }

    /// Credentials stored as a PEM certificate and PEM private key.
    pub fn pem(
        certificate: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
        password: Option<SecretString>,
    ) -> Self {
        Self {
            source: CertificateSource::Pem {
                certificate: certificate.into(),
                private_key: private_key.into(),
            },
            password_path: None,
            password,
        }
    }

    /// Fix up any relative paths in the configuration to use the provided credentials directory.
    ///
    /// # Errors
    ///
    /// If the referenced files don't exist, an error is returned.
    pub fn with_credentials_dir(&mut self, credentials_dir: &Path) -> anyhow::Result<()> {
        let paths = match &mut self.source {
            CertificateSource::Pkcs12 { path } => vec![path],
            CertificateSource::Pem {
                certificate,
                private_key,
            } => vec![certificate, private_key],
        };

        for path in paths {
            if path.is_absolute() {
                tracing::warn!(
                    path = path.display().to_string(),
                    "Path to signing credentials is absolute; consider using systemd credentials"
                );
                continue;
            }
            *path = credentials_dir.join(&*path);
            if !path.exists() {
                return Err(anyhow::anyhow!(
                    "No file named '{}' found in credentials directory",
                    path.display()
                ));
            }
        }

        Ok(())
    }

    fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|password| password.expose_secret())
    }
}

/// A certificate and the private key that matches it.
pub struct CertificateWithKey {
    certificate: X509,
    private_key: PKey<Private>,
}

impl std::fmt::Debug for CertificateWithKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateWithKey")
            .field("subject", &self.certificate.subject_name())
            .finish_non_exhaustive()
    }
}

fn read(path: &Path) -> Result<Vec<u8>, SigningError> {
    std::fs::read(path).map_err(|source| SigningError::Read {
        path: path.to_path_buf(),
        source,
    })
}

// OpenSSL's messages can include details about the key material, so only log them.
fn decode_error(what: &'static str) -> impl FnOnce(ErrorStack) -> SigningError {
    move |error| {
        tracing::debug!(?error, what, "OpenSSL failed to decode signing credentials");
        SigningError::Decode(what)
    }
}

impl CertificateWithKey {
    /// Load the certificate and private key described by `credentials`.
    ///
    /// The password is only exposed to OpenSSL for the duration of the decode.
    pub fn load(credentials: &SigningCredentials) -> Result<Self, SigningError> {
        let (certificate, private_key) = match &credentials.source {
            CertificateSource::Pkcs12 { path } => {
                let bundle = Pkcs12::from_der(&read(path)?)
                    .map_err(decode_error("PKCS #12 bundle"))?
                    .parse2(credentials.password().unwrap_or_default())
                    .map_err(decode_error("PKCS #12 bundle"))?;
                (bundle.cert, bundle.pkey)
            }
            CertificateSource::Pem {
                certificate,
                private_key,
            } => {
                let certificate =
                    X509::from_pem(&read(certificate)?).map_err(decode_error("certificate"))?;
                // An empty passphrase rather than none, otherwise OpenSSL prompts on the terminal
                // for encrypted keys.
                let private_key = PKey::private_key_from_pem_passphrase(
                    &read(private_key)?,
                    credentials.password().unwrap_or_default().as_bytes(),
                )
                .map_err(decode_error("private key"))?;
                (Some(certificate), Some(private_key))
            }
        };

        Self::new(
            certificate.ok_or(SigningError::MissingCertificate)?,
            private_key.ok_or(SigningError::MissingPrivateKey)?,
        )
    }

    /// Pair a certificate with its private key.
    ///
    /// # Errors
    ///
    /// Fails if the key doesn't belong to the certificate, or the certificate isn't currently
    /// within its validity period.
    pub fn new(certificate: X509, private_key: PKey<Private>) -> Result<Self, SigningError> {
        let public_key = certificate
            .public_key()
            .map_err(decode_error("certificate public key"))?;
        if !public_key.public_eq(&private_key) {
            return Err(SigningError::KeyMismatch);
        }

        let now = Asn1Time::days_from_now(0).map_err(|error| {
            tracing::debug!(?error, "Failed to get the current time from OpenSSL");
            SigningError::Rejected
        })?;
        let not_yet_valid = certificate
            .not_before()
            .compare(&now)
            .map_err(decode_error("certificate validity"))?
            .is_gt();
        let expired = certificate
            .not_after()
            .compare(&now)
            .map_err(decode_error("certificate validity"))?
            .is_lt();
        if not_yet_valid || expired {
            tracing::warn!(
                not_before = %certificate.not_before(),
                not_after = %certificate.not_after(),
                "Signing certificate is outside its validity period"
            );
            return Err(SigningError::CertificateNotValid);
        }

        Ok(Self {
            certificate,
            private_key,
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// Sign `payload`, returning a DER-encoded CMS SignedData structure.
    ///
    /// The payload is embedded in the structure along with the signer's certificate. No other
    /// certificates are included.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SigningError> {
        let signed = CmsContentInfo::sign(
            Some(&self.certificate),
            Some(&self.private_key),
            None,
            Some(payload),
            CMSOptions::BINARY,
        )
        .and_then(|signed| signed.to_der())
        .map_err(|error| {
            tracing::debug!(?error, "OpenSSL failed to sign the payload");
            SigningError::Rejected
        })?;

        tracing::debug!(
            payload_size = payload.len(),
            signature_size = signed.len(),
            "Signed payload"
        );
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::Result;
    use openssl::{
        hash::MessageDigest,
        nid::Nid,
        pkcs7::{Pkcs7, Pkcs7Flags},
        rsa::Rsa,
        stack::Stack,
        symm::Cipher,
        x509::{store::X509StoreBuilder, X509Builder, X509NameBuilder},
    };
    use tempfile::{NamedTempFile, TempDir};

    use super::*;

    fn key() -> Result<PKey<Private>> {
        Ok(PKey::from_rsa(Rsa::generate(2048)?)?)
    }

    fn certificate(key: &PKey<Private>, not_before: Asn1Time, not_after: Asn1Time) -> Result<X509> {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, "wsaa signer test")?;
        let name = name.build();

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(key)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.sign(key, MessageDigest::sha256())?;
        Ok(builder.build())
    }

    fn valid_certificate(key: &PKey<Private>) -> Result<X509> {
        certificate(key, Asn1Time::days_from_now(0)?, Asn1Time::days_from_now(30)?)
    }

    // Check the signature with OpenSSL's PKCS #7 implementation, which is what the authority
    // uses. No certificates are supplied, so this only succeeds if the signer's certificate is
    // embedded in the structure.
    fn verify(signed: &[u8]) -> Result<Vec<u8>> {
        let pkcs7 = Pkcs7::from_der(signed)?;
        let store = X509StoreBuilder::new()?.build();
        let mut content = vec![];
        pkcs7.verify(
            &*Stack::<X509>::new()?,
            &store,
            None,
            Some(&mut content),
            Pkcs7Flags::NOVERIFY,
        )?;
        Ok(content)
    }

    #[test]
    fn signature_embeds_payload_and_certificate() -> Result<()> {
        let key = key()?;
        let signer = CertificateWithKey::new(valid_certificate(&key)?, key)?;
        let payload = b"<loginTicketRequest version=\"1.0\"/>";

        let signed = signer.sign(payload)?;

        assert_eq!(payload.as_slice(), verify(&signed)?);
        Ok(())
    }

    #[test]
    fn mismatched_key_is_rejected() -> Result<()> {
        let certificate = valid_certificate(&key()?)?;

        let result = CertificateWithKey::new(certificate, key()?);

        assert!(matches!(result, Err(SigningError::KeyMismatch)));
        Ok(())
    }

    #[test]
    fn expired_certificate_is_rejected() -> Result<()> {
        let key = key()?;
        let certificate = certificate(
            &key,
            Asn1Time::from_unix(1_000_000_000)?,
            Asn1Time::from_unix(1_100_000_000)?,
        )?;

        let result = CertificateWithKey::new(certificate, key);

        assert!(matches!(result, Err(SigningError::CertificateNotValid)));
        Ok(())
    }

    #[test]
    fn load_pkcs12() -> Result<()> {
        let key = key()?;
        let certificate = valid_certificate(&key)?;
        let bundle = Pkcs12::builder()
            .name("wsaa")
            .pkey(&key)
            .cert(&certificate)
            .build2("hunter2")?
            .to_der()?;
        let mut file = NamedTempFile::new()?;
        file.write_all(&bundle)?;

        let password = SecretString::from("hunter2".to_string());
        let credentials = SigningCredentials::pkcs12(file.path(), Some(password));
        let loaded = CertificateWithKey::load(&credentials)?;
        assert_eq!(certificate.to_der()?, loaded.certificate().to_der()?);

        let password = SecretString::from("nope".to_string());
        let credentials = SigningCredentials::pkcs12(file.path(), Some(password));
        assert!(matches!(
            CertificateWithKey::load(&credentials),
            Err(SigningError::Decode(_))
        ));
        Ok(())
    }

    #[test]
    fn load_encrypted_pem() -> Result<()> {
        let key = key()?;
        let mut certificate_file = NamedTempFile::new()?;
        certificate_file.write_all(&valid_certificate(&key)?.to_pem()?)?;
        let mut key_file = NamedTempFile::new()?;
        key_file.write_all(
            &key.private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), b"hunter2")?,
        )?;

        let credentials = SigningCredentials::pem(
            certificate_file.path(),
            key_file.path(),
            Some(SecretString::from("hunter2".to_string())),
        );
        let signer = CertificateWithKey::load(&credentials)?;
        assert_eq!(b"hello".as_slice(), verify(&signer.sign(b"hello")?)?);

        let credentials = SigningCredentials::pem(certificate_file.path(), key_file.path(), None);
        assert!(CertificateWithKey::load(&credentials).is_err());
        Ok(())
    }

    #[test]
    fn missing_file() {
        let credentials = SigningCredentials::pkcs12("/no/such/bundle.p12", None);

        assert!(matches!(
            CertificateWithKey::load(&credentials),
            Err(SigningError::Read { .. })
        ));
    }

    #[test]
    fn password_read_from_file() -> Result<()> {
        let directory = TempDir::new()?;
        let password_path = directory.path().join("password");
        std::fs::write(&password_path, "hunter2\n")?;
        let config = format!(
            "format = \"pkcs12\"\npath = \"bundle.p12\"\npassword_path = \"{}\"\n",
            password_path.display()
        );

        let credentials: SigningCredentials = toml::from_str(&config)?;

        assert_eq!(Some("hunter2"), credentials.password());
        assert_eq!(
            CertificateSource::Pkcs12 {
                path: "bundle.p12".into()
            },
            credentials.source
        );
        assert!(!format!("{credentials:?}").contains("hunter2"));
        Ok(())
    }

    #[test]
    fn empty_password_file_is_rejected() -> Result<()> {
        let directory = TempDir::new()?;
        let password_path = directory.path().join("password");
        std::fs::write(&password_path, "\n")?;
        let config = format!(
            "format = \"pkcs12\"\npath = \"bundle.p12\"\npassword_path = \"{}\"\n",
            password_path.display()
        );

        assert!(toml::from_str::<SigningCredentials>(&config).is_err());
        Ok(())
    }

    #[test]
    fn relative_paths_use_credentials_dir() -> Result<()> {
        let directory = TempDir::new()?;
        std::fs::write(directory.path().join("wsaa.crt"), "")?;
        std::fs::write(directory.path().join("wsaa.key"), "")?;

        let mut credentials = SigningCredentials::pem("wsaa.crt", "wsaa.key", None);
        credentials.with_credentials_dir(directory.path())?;
        assert_eq!(
            CertificateSource::Pem {
                certificate: directory.path().join("wsaa.crt"),
                private_key: directory.path().join("wsaa.key"),
            },
            credentials.source
        );

        let mut credentials = SigningCredentials::pkcs12("missing.p12", None);
        assert!(credentials.with_credentials_dir(directory.path()).is_err());
        Ok(())
    }
}
