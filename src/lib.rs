//! Email authentication engine: SPF, DKIM, DMARC, ARC, and BIMI.
//!
//! Given an RFC 5322 message and optional SMTP envelope data, the
//! [`Authenticator`] produces per-method verdicts plus the wire-format
//! `Received-SPF`, `Authentication-Results`, and ARC sealing headers
//! downstream MTAs expect. [`DkimSigner`] and [`ArcSealer`] cover the
//! signing side.
//!
//! DNS is an injected capability: implement [`DnsResolver`] (or use
//! the bundled hickory-backed [`HickoryResolver`]) and thread it in.
//! Caching is the resolver's business, not this crate's. No state is
//! shared across `authenticate` calls; cancellation is dropping the
//! future.
//!
//! ```no_run
//! use mailproof::{Authenticator, HickoryResolver, SmtpContext};
//!
//! # async fn demo(raw: &[u8]) -> Result<(), mailproof::AuthError> {
//! let outcome = Authenticator::new(HickoryResolver::new())
//!     .mta("mx.example.org")
//!     .authenticate(
//!         raw,
//!         &SmtpContext {
//!             client_ip: Some("203.0.113.7".parse().unwrap()),
//!             helo: Some("mail.example.com".into()),
//!             sender: Some("alice@example.com".into()),
//!         },
//!     )
//!     .await?;
//! print!("{}", outcome.headers);
//! # Ok(())
//! # }
//! ```

pub mod arc;
pub mod auth;
pub mod bimi;
pub mod common;
pub mod dkim;
pub mod dmarc;
pub mod error;
pub mod message;
pub mod report;
pub mod spf;
pub mod tags;

pub use arc::{ArcSealer, ArcStatus, ArcVerdict, ArcVerifier};
pub use auth::{AuthOutcome, Authenticator, SmtpContext};
pub use bimi::{parse_vmc, BimiStatus, BimiVerdict, BimiVerifier, Vmc};
pub use common::dns::{DnsError, DnsResolver, HickoryResolver, MockResolver, MxRecord};
pub use dkim::{DkimSigner, DkimStatus, DkimVerdict, DkimVerifier};
pub use dmarc::{DmarcStatus, DmarcVerdict, DmarcVerifier};
pub use error::AuthError;
pub use message::Message;
pub use spf::{SpfResult, SpfVerdict, SpfVerifier};
