//! A GraphQL execution engine.
//!
//! Requests are normalized and validated against a [`Schema`], planned into fetches against the
//! configured data sources, and resolved into a single response. Subscriptions and one shot
//! operations can also be served over WebSockets with the `graphql-transport-ws` and legacy
//! `graphql-ws` protocols.

#![warn(unreachable_pub)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod json_ext;

pub mod ast;
mod cache;
pub mod configuration;
pub mod engine;
pub mod error;
pub mod graphql;
mod normalization;
pub mod protocols;
pub mod query_planner;
pub mod resolver;
pub mod sources;
mod spec;
pub mod subscription;
mod validation;

pub use configuration::Configuration;
pub use engine::CustomExecutionEngineExecutor;
pub use engine::CustomExecutionEngineStages;
pub use engine::ExecutionEngine;
pub use engine::ExecutionOptions;
pub use normalization::NormalizationResult;
pub use spec::FieldType;
pub use spec::Schema;
pub use validation::ValidationResult;
