// Copyright (C) 2025-present The StreamAvg Authors.
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

//! Metrics export.

use crate::config::TelemetryConfig;
use opentelemetry::metrics::Meter;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use tracing::info;

pub const METER_NAME: &str = "streamavg";

/// Install the OTLP meter provider when telemetry is configured.
///
/// Without it the global no-op meter is returned and the metrics are dropped.
/// Must be called from within a tokio runtime.
pub fn init_meter(
    config: Option<&TelemetryConfig>,
) -> anyhow::Result<(Meter, Option<SdkMeterProvider>)> {
    let Some(config) = config else {
        info!("No telemetry configured, metrics are not exported");
        return Ok((opentelemetry::global::meter(METER_NAME), None));
    };
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.url.clone())
        .with_timeout(config.exporter_timeout)
        .build()?;
    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.reader_interval)
        .build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::builder().with_service_name(METER_NAME).build())
        .build();
    opentelemetry::global::set_meter_provider(provider.clone());
    info!(
        "Exporting metrics to {} every {:?}",
        config.url, config.reader_interval
    );
    Ok((opentelemetry::global::meter(METER_NAME), Some(provider)))
}
