pub mod config;
pub mod database;
pub mod distance;
pub mod error;
pub mod pipeline;
pub mod position;
pub mod presence;
pub mod reaper;
pub mod registry;
pub mod report;
pub mod trail;
pub mod validation;

pub use config::Config;
pub use database::Database;
pub use error::{PayloadError, RejectReason};
pub use pipeline::{EngineEvent, IngestionPipeline, PerObservationResult};
pub use registry::{AnchorRegistry, AssetDirectory, SiteRegistry};
