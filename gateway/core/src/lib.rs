//! Gateway Core - Routing and Translation for LLM Traffic
//!
//! This crate accepts requests in one canonical message shape, picks an
//! upstream endpoint for each, calls it over that provider's own protocol,
//! and hands back canonical responses or event streams. It has no HTTP
//! server of its own; the daemon crate puts one in front of it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     PipelineOrchestrator                          │
//! │                                                                   │
//! │  CanonicalRequest                                                 │
//! │        │                                                          │
//! │        ▼                                                          │
//! │  ┌──────────────┐   category    ┌──────────────┐                  │
//! │  │    Router    │──────────────▶│ LoadBalancer │ (one per category)│
//! │  │ (classifier) │◀──────────────│              │                  │
//! │  └──────┬───────┘   endpoint    └──────────────┘                  │
//! │         │                ▲                                        │
//! │         │                │ is_healthy / record_*                  │
//! │         ▼                │                                        │
//! │  ┌──────────────┐   ┌────┴───────────┐                            │
//! │  │    Retry     │──▶│ HealthRegistry │ (only shared mutable state) │
//! │  │  Controller  │   └────────────────┘                            │
//! │  └──────┬───────┘                                                 │
//! │         ▼                                                         │
//! │  ┌──────────────────────────────────────────────┐                 │
//! │  │ ProviderClient: openai │ ollama │ bedrock │ gemini │          │
//! │  └──────┬───────────────────────────────────────┘                 │
//! │         ▼ UpstreamEvent                                           │
//! │  ┌──────────────────┐                                             │
//! │  │ StreamTranslator │──▶ CanonicalEvent stream / CanonicalResponse │
//! │  └──────────────────┘                                             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`PipelineOrchestrator`]: owns everything; `process_incoming_request`
//! - [`GatewayConfig`]: validated, read-only configuration
//! - [`CanonicalRequest`] / [`CanonicalResponse`] / [`CanonicalEvent`]
//! - [`GatewayError`]: the error taxonomy
//!
//! # Quick Start
//!
//! ```ignore
//! use gateway_core::{load_config, CanonicalRequest, GatewayResponse, PipelineOrchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let orchestrator = PipelineOrchestrator::new(&config)?;
//!     orchestrator.start();
//!
//!     let request = CanonicalRequest::new("fast-model", "Hello!", 256);
//!     match orchestrator
//!         .process_incoming_request(request, &CancellationToken::new())
//!         .await?
//!     {
//!         GatewayResponse::Unary { response, route } => {
//!             println!("{} via {}", response.text(), route.endpoint);
//!         }
//!         GatewayResponse::Stream { .. } => unreachable!(),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`config`]: TOML configuration, environment overrides, validation
//! - [`error`]: [`GatewayError`] and [`ErrorKind`]
//! - [`messages`]: canonical request, response, and event types
//! - [`routing`]: categories, health, load balancing, retry
//! - [`providers`]: upstream protocol adapters
//! - [`streaming`]: stream priming and translation
//! - [`pipeline`]: per-request state machine and the orchestrator

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod messages;
pub mod pipeline;
pub mod providers;
pub mod routing;
pub mod streaming;

pub use config::{
    default_config_path, load_config, load_config_from_path, parse_config, ConfigError,
    ConfigSource, Endpoint, EndpointId, GatewayConfig, ProviderKind,
};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use messages::{
    CanonicalEvent, CanonicalRequest, CanonicalResponse, ContentBlock, CorrelationId, Message,
    StopReason, Usage,
};
pub use pipeline::{GatewayResponse, PipelineOrchestrator, RouteInfo, Stage, SystemStatus};
pub use providers::{ProviderClient, ProviderRegistry};
pub use routing::{HealthRegistry, HealthStatus, Router, RoutingCategory};
pub use streaming::CanonicalStream;
