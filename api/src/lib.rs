//! Hosts the storage contract of the folio portfolio server.
//!
//! Everything the site persists goes through one [`storage::StorageBackend`]: a key-value
//! interface with a uniform result [`envelope::Envelope`], implemented by interchangeable
//! local and remote backends. This crate holds the contract only; implementations live in the
//! `impls` crate.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(missing_docs)]

/// Contains interface for authorizer that is run before every mutating request, and a no-op implementation.
pub mod auth;
/// Implements the error type ([`error::StorageError`]) used inside backends and by the layers above them.
pub mod error;

/// Contains the [`envelope::Envelope`] result shape returned by every storage operation.
pub mod envelope;

/// Contains [`storage::StorageBackend`] interface which needs to be implemented by every storage backend.
pub mod storage;
