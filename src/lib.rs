//! formseal - Encrypted Form Submission Library
//!
//! Lets an untrusted web client submit form data without it ever crossing the
//! network in cleartext. The server holds a per-client RSA key pair for the
//! life of a session; the client encrypts each field with the public key,
//! chunking values larger than one RSA block, and the server decrypts and
//! reassembles them.
//!
//! # Overview
//!
//! ```text
//! client                                   server
//! ------                                   ------
//! ClientKeyCache ── k=true ──────────────▶ IntegrityGate ─▶ KeyVault (get or create)
//!      ◀──────────────── public key PEM ──
//! ChunkedCipher (encrypt each field)
//! SubmissionOrchestrator ── fields ──────▶ IntegrityGate ─▶ ChunkedCipher (decrypt)
//!                                                         └▶ CertificateAuthority
//!                                                            (sign, verify, authenticate)
//! ```
//!
//! Every request carries three integrity headers: a programmatic-call marker,
//! the application token bound to the session, and a base64 digest of the
//! body's canonical `k=v&k=v` string. Requests failing any of them are
//! rejected before key material is touched.
//!
//! # Quick Start
//!
//! ```bash
//! # Serve ./web_root and POST /proxy on 127.0.0.1:3000
//! cargo run --release
//! ```
//!
//! ## As a Library
//!
//! ```no_run
//! use formseal::client::{ClientConfig, ClientKeyCache, HttpTransport, StorageKind, SubmissionOrchestrator};
//! use formseal::configs::AppConfig;
//!
//! # async fn example() -> Result<(), formseal::error::ClientError> {
//! let config = AppConfig::default();
//! let transport = HttpTransport::new("http://127.0.0.1:3000/proxy")?;
//! let cache = ClientKeyCache::new(&StorageKind::Session);
//! let mut form = SubmissionOrchestrator::new(transport, cache, ClientConfig::from_app(&config))
//!     .on_error(|e| eprintln!("submission failed: {}", e));
//!
//! let response = form.submit(&[("name", "John"), ("email", "a@b.com")]).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Module Overview
//!
//! - [`identity`]: proxy-aware client address resolution
//! - [`integrity`]: marker, token and checksum validation
//! - [`key_vault`]: session-scoped key pairs, certificates and bundles
//! - [`certificate_authority`]: X.509, PKCS#12 and PKCS#7 operations
//! - [`signature`]: detached RSA signatures, library API not reachable over `do=`
//! - [`chunked_cipher`]: chunked RSA transport encryption and AES wrapping
//! - [`gateway`]: transport-independent server request flow
//! - [`webserver`]: axum adapter
//! - [`client`]: key cache, transports and submission orchestration

pub mod certificate_authority;
pub mod chunked_cipher;
pub mod client;
pub mod configs;
pub mod entropy;
pub mod error;
pub mod field;
pub mod gateway;
pub mod identity;
pub mod integrity;
pub mod key_vault;
pub mod protocol;
pub mod session;
pub mod signature;
pub mod webserver;
