#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
//! Client access layer for remote patient pseudonymization services.
//!
//! A calling application obtains short-lived [`Session`]s from the service
//! and, within a session, exchanges permanent patient identifiers
//! ([`PatientId`]) for single-use temporary identifiers ("temp-ids").
//! A temp-id doubles as a capability token: whoever holds it may retrieve a
//! bounded, pre-declared subset of patient data without ever handling
//! permanent identifiers or credentials. The session keeps a bidirectional
//! cache between permanent identifiers and temp-ids, so repeated lookups
//! cost no network traffic, and the cache can be rebuilt from the service's
//! token listing when a session is reattached after a restart.
//!
//! # Examples
//!
//! ```no_run
//! use pseudokit_core::{Connection, PatientId};
//!
//! # tokio_test::block_on(async {
//! let connection =
//!     Connection::new("https://pseudonyms.example.org", "api-key", None).unwrap();
//! let session = connection.create_session().await.unwrap();
//! session.set_default_result_fields(["vorname", "nachname"]);
//!
//! let patient = PatientId::new("intid", "42").unwrap();
//! let temp_id = session.get_temp_id(&patient).await.unwrap();
//!
//! // The second call is served from the cache.
//! assert_eq!(session.get_temp_id(&patient).await.unwrap(), temp_id);
//! # });
//! ```

mod connection;
pub use connection::*;

mod error;
pub use error::*;

mod patient_id;
pub use patient_id::*;

mod session;
pub use session::*;

mod token;
pub use token::*;

// private modules
mod http;
