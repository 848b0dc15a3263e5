// ===============================
// src/lib.rs
// ===============================
//
// Library surface shared by the service binary and the request layer:
// the executor and publisher entry points, the store queries behind them,
// and the collaborator traits with their in-process implementations.
//
pub mod domain;
pub mod config;
pub mod metrics;
pub mod cache;
pub mod store;
pub mod positions;
pub mod valuation;
pub mod signing;          // HMAC helpers for the settlement relay
pub mod gateway;          // settlement program: mock + relay
pub mod ledger;           // JSON-RPC transaction fetcher + log classification
pub mod feed;
pub mod executor;
pub mod publisher;
pub mod reconciler;
pub mod scheduler;
pub mod recorder;
#[cfg(test)]
mod testutil;
