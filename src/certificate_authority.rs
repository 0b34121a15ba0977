//! Session Certificate Authority
//!
//! Builds self-signed X.509 certificates for session key pairs and derives
//! the PKCS#12 and PKCS#7 artifacts used by the sign, verify, encrypt and
//! authenticate flows.
//!
//! # Artifact Flow
//! ```text
//! KeyPairRecord
//!   └── CSR (subject = configured DN, email = keyring label)
//!       └── Self-signed X.509 (validity_days)
//!           ├── PKCS#12 bundle (passphrase = identity or PIN)
//!           └── PKCS#7 S/MIME sign / verify / encrypt / decrypt
//! ```
//!
//! # Certificate Properties
//! - **Version**: X.509v3
//! - **Basic Constraints**: CA=false
//! - **Subject Key Identifier**: hash of the public key
//! - **Signature Algorithm**: SHA-256 with RSA
//! - **Serial Number**: Random 128-bit number
//!
//! # Example
//! ```rust,no_run
//! # use formseal::certificate_authority::{CertificateBuilder, DistinguishedName};
//! # use formseal::configs::CertificateDefaults;
//! # use formseal::key_vault::KeyPairRecord;
//! # fn example(keypair: &KeyPairRecord) -> formseal::error::CryptoResult<()> {
//! let certificate = CertificateBuilder::new(DistinguishedName::from(&CertificateDefaults::default()))
//!     .email("alice@example.com".to_string())
//!     .validity_days(30)
//!     .build(keypair)?;
//! # Ok(())
//! # }
//! ```

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::extension::{BasicConstraints, SubjectKeyIdentifier};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509Name, X509NameBuilder, X509Ref, X509Req, X509ReqBuilder, X509};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use tracing::debug;

use crate::configs::CertificateDefaults;
use crate::error::{CryptoError, CryptoResult};
use crate::key_vault::KeyPairRecord;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

/// Subject fields recognized for session certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
    pub common_name: String,
    pub email: String,
}

impl From<&CertificateDefaults> for DistinguishedName {
    fn from(defaults: &CertificateDefaults) -> Self {
        Self {
            country: defaults.country.clone(),
            state: defaults.state.clone(),
            locality: defaults.locality.clone(),
            organization: defaults.organization.clone(),
            organizational_unit: defaults.organizational_unit.clone(),
            common_name: defaults.common_name.clone(),
            email: defaults.email.clone(),
        }
    }
}

impl DistinguishedName {
    fn to_x509_name(&self) -> CryptoResult<X509Name> {
        let mut builder = X509NameBuilder::new()
            .map_err(|e| CryptoError::Certificate(format!("Failed to create name builder: {}", e)))?;
        let entries = [
            (Nid::COUNTRYNAME, &self.country),
            (Nid::STATEORPROVINCENAME, &self.state),
            (Nid::LOCALITYNAME, &self.locality),
            (Nid::ORGANIZATIONNAME, &self.organization),
            (Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit),
            (Nid::COMMONNAME, &self.common_name),
            (Nid::PKCS9_EMAILADDRESS, &self.email),
        ];
        for (nid, value) in entries {
            if value.is_empty() {
                continue;
            }
            builder.append_entry_by_nid(nid, value).map_err(|e| {
                CryptoError::Certificate(format!(
                    "Failed to set {}: {}",
                    nid.short_name().unwrap_or("name entry"),
                    e
                ))
            })?;
        }
        Ok(builder.build())
    }
}

/// A certificate issued for one keyring slot. Never mutated, only reissued.
#[derive(Clone)]
pub struct CertificateRecord {
    pem: String,
    pub subject: DistinguishedName,
    pub validity_days: u32,
    pub identity: String,
    pub label: String,
}

impl CertificateRecord {
    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn x509(&self) -> CryptoResult<X509> {
        X509::from_pem(self.pem.as_bytes())
            .map_err(|e| CryptoError::Certificate(format!("Failed to parse certificate: {}", e)))
    }

    /// Same certificate as `other`, compared by DER encoding.
    pub fn matches(&self, other: &X509Ref) -> bool {
        match (self.x509().and_then(|c| der(&c)), der(other)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("subject", &self.subject)
            .field("validity_days", &self.validity_days)
            .field("identity", &self.identity)
            .field("label", &self.label)
            .finish()
    }
}

fn der(cert: &X509Ref) -> CryptoResult<Vec<u8>> {
    cert.to_der()
        .map_err(|e| CryptoError::Certificate(format!("Failed to encode certificate: {}", e)))
}

/// Builder for self-signed session certificates.
pub struct CertificateBuilder {
    subject: DistinguishedName,
    validity_days: u32,
}

impl CertificateBuilder {
    pub fn new(subject: DistinguishedName) -> Self {
        Self {
            subject,
            validity_days: 365,
        }
    }

    /// Override the subject email address.
    pub fn email(mut self, email: String) -> Self {
        self.subject.email = email;
        self
    }

    pub fn common_name(mut self, cn: String) -> Self {
        self.subject.common_name = cn;
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Build a CSR for the key pair and self-sign it.
    pub fn build(self, keypair: &KeyPairRecord) -> CryptoResult<CertificateRecord> {
        let csr = build_csr(&self.subject, keypair.private_key())?;
        let cert = self_sign(&csr, keypair.private_key(), self.validity_days)?;
        let pem = cert
            .to_pem()
            .map_err(|e| CryptoError::Certificate(format!("Failed to encode PEM: {}", e)))
            .and_then(|pem| String::from_utf8(pem).map_err(|_| CryptoError::InvalidUtf8))?;
        debug!(
            identity = %keypair.identity,
            label = %keypair.label,
            days = self.validity_days,
            "issued session certificate"
        );
        Ok(CertificateRecord {
            pem,
            subject: self.subject,
            validity_days: self.validity_days,
            identity: keypair.identity.clone(),
            label: keypair.label.clone(),
        })
    }
}

/// Build a signing request from `dn` and self-sign it for `days`.
pub fn create_csr_and_sign(
    dn: &DistinguishedName,
    keypair: &KeyPairRecord,
    days: u32,
) -> CryptoResult<CertificateRecord> {
    CertificateBuilder::new(dn.clone())
        .validity_days(days)
        .build(keypair)
}

fn build_csr(dn: &DistinguishedName, key: &PKeyRef<Private>) -> CryptoResult<X509Req> {
    let mut builder = X509ReqBuilder::new()
        .map_err(|e| CryptoError::Certificate(format!("Failed to create CSR builder: {}", e)))?;
    builder
        .set_version(0)
        .map_err(|e| CryptoError::Certificate(format!("Failed to set CSR version: {}", e)))?;
    let name = dn.to_x509_name()?;
    builder
        .set_subject_name(&name)
        .map_err(|e| CryptoError::Certificate(format!("Failed to set CSR subject: {}", e)))?;
    builder
        .set_pubkey(key)
        .map_err(|e| CryptoError::Certificate(format!("Failed to set CSR public key: {}", e)))?;
    builder
        .sign(key, MessageDigest::sha256())
        .map_err(|e| CryptoError::Certificate(format!("Failed to sign CSR: {}", e)))?;
    Ok(builder.build())
}

fn self_sign(csr: &X509Req, key: &PKeyRef<Private>, days: u32) -> CryptoResult<X509> {
    let cert_err = |what: &str, e: openssl::error::ErrorStack| {
        CryptoError::Certificate(format!("Failed to {}: {}", what, e))
    };

    let mut builder = X509::builder().map_err(|e| cert_err("create X509 builder", e))?;
    builder
        .set_version(X509_VERSION_3)
        .map_err(|e| cert_err("set version", e))?;

    let mut serial = BigNum::new().map_err(|e| cert_err("allocate serial", e))?;
    serial
        .rand(128, MsbOption::MAYBE_ZERO, false)
        .map_err(|e| cert_err("generate serial", e))?;
    let serial = serial
        .to_asn1_integer()
        .map_err(|e| cert_err("encode serial", e))?;
    builder
        .set_serial_number(&serial)
        .map_err(|e| cert_err("set serial", e))?;

    builder
        .set_subject_name(csr.subject_name())
        .map_err(|e| cert_err("set subject", e))?;
    builder
        .set_issuer_name(csr.subject_name())
        .map_err(|e| cert_err("set issuer", e))?;

    let not_before = Asn1Time::days_from_now(0).map_err(|e| cert_err("create not_before", e))?;
    builder
        .set_not_before(&not_before)
        .map_err(|e| cert_err("set not_before", e))?;
    let not_after = Asn1Time::days_from_now(days).map_err(|e| cert_err("create not_after", e))?;
    builder
        .set_not_after(&not_after)
        .map_err(|e| cert_err("set not_after", e))?;

    let public = csr.public_key().map_err(|e| cert_err("read CSR public key", e))?;
    builder
        .set_pubkey(&public)
        .map_err(|e| cert_err("set public key", e))?;

    let bc = BasicConstraints::new()
        .build()
        .map_err(|e| cert_err("build BasicConstraints", e))?;
    builder
        .append_extension(bc)
        .map_err(|e| cert_err("add BasicConstraints", e))?;
    let ski = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(None, None))
        .map_err(|e| cert_err("build SubjectKeyIdentifier", e))?;
    builder
        .append_extension(ski)
        .map_err(|e| cert_err("add SubjectKeyIdentifier", e))?;

    builder
        .sign(key, MessageDigest::sha256())
        .map_err(|e| cert_err("sign certificate", e))?;
    Ok(builder.build())
}

/// Password protected certificate and key, DER encoded.
#[derive(Clone)]
pub struct Pkcs12Bundle {
    der: Vec<u8>,
    pub friendly_name: String,
}

impl Pkcs12Bundle {
    pub fn from_der(der: Vec<u8>, friendly_name: &str) -> Self {
        Self {
            der,
            friendly_name: friendly_name.to_string(),
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

impl fmt::Debug for Pkcs12Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs12Bundle")
            .field("friendly_name", &self.friendly_name)
            .field("der", &format!("<{} bytes>", self.der.len()))
            .finish()
    }
}

/// Certificate and key recovered from a bundle.
pub struct ImportedPkcs12 {
    pub certificate: X509,
    pub private_key: PKey<Private>,
}

impl fmt::Debug for ImportedPkcs12 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportedPkcs12")
            .field("certificate", &self.certificate.subject_name())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

pub fn export_pkcs12(
    cert: &CertificateRecord,
    keypair: &KeyPairRecord,
    passphrase: &SecretString,
    friendly_name: &str,
) -> CryptoResult<Pkcs12Bundle> {
    let x509 = cert.x509()?;
    let pkcs12 = Pkcs12::builder()
        .name(friendly_name)
        .pkey(keypair.private_key())
        .cert(&x509)
        .build2(passphrase.expose_secret())
        .map_err(|e| CryptoError::Pkcs12(format!("Failed to build bundle: {}", e)))?;
    let der = pkcs12
        .to_der()
        .map_err(|e| CryptoError::Pkcs12(format!("Failed to encode bundle: {}", e)))?;
    Ok(Pkcs12Bundle::from_der(der, friendly_name))
}

/// Open a bundle. A wrong passphrase is an error, never an empty result.
pub fn import_pkcs12(bundle: &Pkcs12Bundle, passphrase: &SecretString) -> CryptoResult<ImportedPkcs12> {
    let parsed = Pkcs12::from_der(bundle.der())
        .map_err(|e| CryptoError::Pkcs12(format!("Malformed bundle: {}", e)))?
        .parse2(passphrase.expose_secret())
        .map_err(|_| CryptoError::Pkcs12("wrong passphrase or corrupt bundle".to_string()))?;
    match (parsed.cert, parsed.pkey) {
        (Some(certificate), Some(private_key)) => Ok(ImportedPkcs12 {
            certificate,
            private_key,
        }),
        _ => Err(CryptoError::Pkcs12(
            "bundle lacks a certificate or private key".to_string(),
        )),
    }
}

/// Outcome of opening a signed S/MIME message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMessage {
    pub verified: bool,
    pub content: Vec<u8>,
}

fn pkcs7_err(what: &str) -> impl Fn(openssl::error::ErrorStack) -> CryptoError + '_ {
    move |e| CryptoError::Pkcs7(format!("Failed to {}: {}", what, e))
}

fn smime_string(p7: &Pkcs7, input: &[u8], flags: Pkcs7Flags) -> CryptoResult<String> {
    let smime = p7.to_smime(input, flags).map_err(pkcs7_err("write S/MIME"))?;
    String::from_utf8(smime).map_err(|_| CryptoError::InvalidUtf8)
}

/// Sign `message` with the certificate's key; returns an S/MIME document.
pub fn sign_pkcs7(
    message: &[u8],
    cert: &X509Ref,
    key: &PKeyRef<Private>,
) -> CryptoResult<String> {
    let extra: Stack<X509> = Stack::new().map_err(pkcs7_err("allocate certificate stack"))?;
    let p7 = Pkcs7::sign(cert, key, &extra, message, Pkcs7Flags::BINARY)
        .map_err(pkcs7_err("sign message"))?;
    smime_string(&p7, message, Pkcs7Flags::BINARY)
}

/// Verify a signed S/MIME document against the trusted signer certificates.
///
/// Only signatures by one of `trusted` verify; chain building is not
/// attempted. A bad signature yields `verified: false`, a document that
/// cannot be parsed is an error.
pub fn verify_pkcs7(smime: &str, trusted: &[X509]) -> CryptoResult<VerifiedMessage> {
    let (p7, detached) = Pkcs7::from_smime(smime.as_bytes()).map_err(pkcs7_err("parse S/MIME"))?;
    let mut certs: Stack<X509> = Stack::new().map_err(pkcs7_err("allocate certificate stack"))?;
    for cert in trusted {
        certs
            .push(cert.clone())
            .map_err(pkcs7_err("collect trusted certificates"))?;
    }
    let store = X509StoreBuilder::new()
        .map_err(pkcs7_err("create certificate store"))?
        .build();
    let mut content = Vec::new();
    let verified = p7
        .verify(
            &certs,
            &store,
            detached.as_deref(),
            Some(&mut content),
            Pkcs7Flags::NOINTERN | Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
        )
        .is_ok();
    if !verified {
        content.clear();
    }
    Ok(VerifiedMessage { verified, content })
}

/// Envelope-encrypt `message` to the recipients with AES-256-CBC.
pub fn encrypt_pkcs7(message: &[u8], recipients: &[X509]) -> CryptoResult<String> {
    let mut certs: Stack<X509> = Stack::new().map_err(pkcs7_err("allocate certificate stack"))?;
    for cert in recipients {
        certs
            .push(cert.clone())
            .map_err(pkcs7_err("collect recipients"))?;
    }
    let p7 = Pkcs7::encrypt(&certs, message, Cipher::aes_256_cbc(), Pkcs7Flags::BINARY)
        .map_err(pkcs7_err("encrypt message"))?;
    smime_string(&p7, message, Pkcs7Flags::BINARY)
}

pub fn decrypt_pkcs7(smime: &str, cert: &X509Ref, key: &PKeyRef<Private>) -> CryptoResult<Vec<u8>> {
    let (p7, _) = Pkcs7::from_smime(smime.as_bytes()).map_err(pkcs7_err("parse S/MIME"))?;
    p7.decrypt(key, cert, Pkcs7Flags::BINARY)
        .map_err(pkcs7_err("decrypt message"))
}

/// Sign, then envelope the signed document to the same certificate.
pub fn encrypt_sign_pkcs7(
    message: &[u8],
    cert: &X509Ref,
    key: &PKeyRef<Private>,
) -> CryptoResult<String> {
    let signed = sign_pkcs7(message, cert, key)?;
    encrypt_pkcs7(signed.as_bytes(), &[cert.to_owned()])
}

/// Reverse of [`encrypt_sign_pkcs7`].
pub fn decrypt_verify_pkcs7(
    smime: &str,
    cert: &X509Ref,
    key: &PKeyRef<Private>,
) -> CryptoResult<VerifiedMessage> {
    let signed = decrypt_pkcs7(smime, cert, key)?;
    let signed = String::from_utf8(signed).map_err(|_| CryptoError::InvalidUtf8)?;
    verify_pkcs7(&signed, &[cert.to_owned()])
}

/// Issues certificates and bundles from the configured defaults.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    defaults: CertificateDefaults,
}

impl CertificateAuthority {
    pub fn new(defaults: CertificateDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &CertificateDefaults {
        &self.defaults
    }

    /// Subject for a keyring slot; email-like labels replace the email.
    pub fn distinguished_name(&self, label: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::from(&self.defaults);
        if label.contains('@') {
            dn.email = label.to_string();
        }
        dn
    }

    pub fn issue(&self, keypair: &KeyPairRecord) -> CryptoResult<CertificateRecord> {
        create_csr_and_sign(
            &self.distinguished_name(&keypair.label),
            keypair,
            self.defaults.validity_days,
        )
    }

    pub fn export(
        &self,
        cert: &CertificateRecord,
        keypair: &KeyPairRecord,
        passphrase: &SecretString,
    ) -> CryptoResult<Pkcs12Bundle> {
        export_pkcs12(cert, keypair, passphrase, &self.defaults.friendly_name)
    }
}
