//! Core domain types for the RapidFlow CI/CD engine.
//!
//! This crate contains:
//! - The shared error type
//! - Job/step/runnable/deployment status enums
//! - The in-memory pipeline configuration tree
//! - The Docker-style port-spec parser

pub mod config;
pub mod error;
pub mod ports;
pub mod status;

pub use config::{OutputConfig, PipelineConfig, RunnableConfig, StepConfig};
pub use error::{Error, Result};
pub use ports::PortMapping;
pub use status::{DeploymentStatus, JobStatus, RunnableStatus, StepStatus};
