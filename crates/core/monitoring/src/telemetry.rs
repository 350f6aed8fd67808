//! Utilities for running [OpenTelemetry](https://docs.rs/opentelemetry/latest/opentelemetry)
//! exporters and recording OpenTelemetry [metrics].

pub use opentelemetry_otlp::ExporterBuildError;

pub mod metrics;
