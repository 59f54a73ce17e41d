// Copyright (C) 2026-present The rcaflow Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::TelemetryConfig;
use opentelemetry::{global, metrics::Meter, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use tracing::{info, warn};

pub const METER_NAME: &str = "rcaflow-agent";

/// Install the global meter provider exporting to the configured OTLP
/// endpoint. Must be called from within the tokio runtime.
pub fn init_meter_provider(config: &TelemetryConfig) -> anyhow::Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.url())
        .with_timeout(config.exporter_timeout)
        .build()?;
    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.reader_interval)
        .build();
    let resource = Resource::builder()
        .with_service_name(METER_NAME)
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();
    global::set_meter_provider(provider.clone());
    info!(
        "Exporting metrics to {} every {:?}",
        config.url(),
        config.reader_interval
    );
    Ok(provider)
}

/// Meter used by the ingestion stats, backed by whatever provider is
/// installed globally (a no-op one when telemetry is not configured)
pub fn meter() -> Meter {
    global::meter(METER_NAME)
}

pub fn shutdown_meter_provider(provider: SdkMeterProvider) {
    if let Err(err) = provider.shutdown() {
        warn!("Failed to flush metrics on shutdown: {err}");
    }
}
