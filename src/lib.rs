//! # Proximity - nearby business search
//!
//! Proximity answers "which businesses lie within R meters of this point",
//! ordered nearest first, while businesses are created, moved and removed
//! underneath it.
//!
//! ## Features
//!
//! - **Geohash Bucketing**: A concurrent in-memory index of fixed-precision buckets
//! - **Exact Results**: Great-circle filtering and stable distance-then-id ordering
//! - **Cache Consistency**: Versioned entity entries and generation-stamped query entries
//! - **Coordinated Writes**: Store first, then index and cache with bounded retries
//! - **Reconciliation**: Full rebuilds and incremental repair of index drift
//! - **Persistent Storage**: Append-only file (AOF) format with replay and compaction
//! - **HTTP Surface**: JSON endpoints with admission control and request timeouts
//!
//! ## Quick Start
//!
//! ```rust
//! use proximity::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> proximity::Result<()> {
//! // In-memory store, default cache and index settings
//! let service = ProximityService::open(Config::default()).await?;
//!
//! let cafe = service
//!     .writes()
//!     .create(BusinessDraft::new("Blue Door", "Seongsu-dong", 37.5478, 127.0452, Category::Cafe))
//!     .await?;
//!
//! // Everything within 500 m, at most 10 hits
//! let query = NearbyQuery::new(37.5475, 127.0450, 500.0).with_limit(10);
//! let hits = service.reads().nearby(&query).await?;
//! assert_eq!(hits[0].business.id, cafe.id);
//!
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Serving HTTP
//!
//! ```rust,no_run
//! use proximity::{Config, ProximityService, http};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! let addr = config.server.socket_addr()?;
//! let service = ProximityService::open(config).await?;
//!
//! let listener = tokio::net::TcpListener::bind(addr).await?;
//! axum::serve(listener, http::router(service)).await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod cache;
pub mod config;
pub mod consistency;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod http;
pub mod index;
pub mod persistence;
pub mod reconcile;
pub mod retry;
pub mod service;
pub mod spatial;
pub mod store;
pub mod telemetry;
pub mod types;

// Core error types
pub use error::{Component, ProximityError, Result};

// Domain types
pub use types::{Business, BusinessDraft, BusinessId, BusinessUpdate, Category, Version};

// Spatial primitives
pub use spatial::{BoundingBox, BucketGrid, Point};

// Engine components
pub use cache::{Cache, MemoryCache};
pub use config::Config;
pub use consistency::CacheLayer;
pub use coordinator::WriteCoordinator;
pub use engine::{NearbyHit, NearbyQuery, QueryEngine};
pub use index::{Neighbor, SpatialIndex};
pub use reconcile::{Reconciler, SyncReport};
pub use service::ProximityService;
pub use store::{AofStore, Store};

// Persistence types for advanced usage
pub use persistence::{AofCommand, AofFile, SyncPolicy};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        Business, BusinessDraft, BusinessId, BusinessUpdate, Category, Config, NearbyHit,
        NearbyQuery, Point, ProximityError, ProximityService, Result,
    };
}
