//! Hosts [`Authorizer`] implementations guarding the mutating routes of the folio server.
//!
//! The site's editors authenticate with a bearer JSON Web Token issued elsewhere; this crate only
//! verifies it.
//!
//! [`Authorizer`]: api::auth::Authorizer

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(missing_docs)]

/// Contains the bearer JWT authorizer.
#[cfg(feature = "jwt")]
pub mod jwt;
