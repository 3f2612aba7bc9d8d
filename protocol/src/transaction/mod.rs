//! # Transaction Module
//!
//! Encoding, construction and validation of ticknet transactions.
//!
//! ```text
//! types.rs        — wire layout, decoded Transaction, hex display
//! builder.rs      — create_transaction for local entities
//! verification.rs — stateless validation and the resource-test predicate
//! ```
//!
//! Nodes do not track balances. Validation is purely structural plus one
//! signature check, so a node can forward a transaction the moment it
//! arrives. Whether it is spendable is decided by the computors at the tick
//! the transaction names.

pub mod builder;
pub mod types;
pub mod verification;

pub use builder::{create_transaction, TransactionParams};
pub use types::Transaction;
pub use verification::{is_resource_test_candidate, validate_transaction, TransactionError};
