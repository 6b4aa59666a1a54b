//! # tandem-registrar-core
//!
//! Extension identities, their transient network bindings, and the
//! REGISTER flow.
//!
//! The [`registry::ExtensionRegistry`] is the in-memory truth for who
//! exists (seeded from the store at boot) and where each extension can
//! currently be reached. Bindings expire; a sweep task prunes them, and
//! `is_registered` checks the deadline so a binding never outlives it
//! between sweeps.
//!
//! The [`registrar::Registrar`] drives REGISTER handling: credential
//! verification (digest by default, trust-by-IP for closed LANs),
//! binding refresh, and device tracking rows in the store. On boot it
//! purges every phone row left over from the previous process; phones
//! re-REGISTER on their own schedule.

pub mod auth;
pub mod error;
pub mod registrar;
pub mod registry;
pub mod types;

pub use error::{Error, Result};
pub use registrar::{RegisterOutcome, Registrar};
pub use registry::ExtensionRegistry;
pub use types::{AuthMode, Extension, Registration, RegistrarConfig};
