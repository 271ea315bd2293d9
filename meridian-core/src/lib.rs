//! # Meridian Core
//!
//! The provider-agnostic dispatch core for the Meridian gateway: request
//! routing, retries, per-provider health tracking, per-provider key pools,
//! the extended-thinking signature cache, and the six backend adapters
//! (Anthropic, Z.AI, Ollama, Bedrock, Azure AI Foundry, Vertex AI).
//!
//! This crate has no knowledge of HTTP frameworks, config file formats, or
//! ingress auth — it takes an already-parsed Messages request and a set of
//! configured providers and returns a response (or a stream of response
//! events). The `meridian-gateway` crate owns the axum server and wires its
//! config into a [`dispatch::DispatchHandler`] built from these pieces.
//!
//! ## Modules
//!
//! - [`models`] — the Anthropic Messages wire types every provider adapter
//!   speaks internally.
//! - [`routing`] — candidate selection strategies and the parallel-race
//!   retry engine.
//! - [`health`] — per-provider circuit breaker state.
//! - [`key_pool`] — per-provider rotating credential pools with RPM/TPM
//!   tracking.
//! - [`signature_cache`] — makes extended-thinking signatures portable
//!   across a model group.
//! - [`cache`] — the backend-agnostic cache abstraction the signature cache
//!   and providers' own response caching build on.
//! - [`providers`] — the `ProviderAdapter` trait and its six implementations.
//! - [`dispatch`] — coordinates all of the above for one request.
//! - [`triggers`] — classifies which failures warrant failing over.
//! - [`error`] — the crate's error taxonomy.

pub mod cache;
pub mod common;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod key_pool;
pub mod models;
pub mod providers;
pub mod routing;
pub mod signature_cache;
pub mod triggers;

pub use dispatch::{DispatchHandler, DispatchOutcome, DispatchRequest, ProviderEntry};
pub use error::{CoreError, ProviderError};
pub use health::{HealthConfig, HealthState, HealthTracker, Outcome};
pub use key_pool::{FailureKind, KeyConfig, KeyPool, SelectionStrategy};
pub use models::{MessagesRequest, MessagesResponse, StreamEvent};
pub use providers::{ProviderAdapter, ProviderDescriptor, ProviderKind};
pub use routing::{ProviderInfo, Router, RoutingStrategy};
pub use signature_cache::SignatureCache;
