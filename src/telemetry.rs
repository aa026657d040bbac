use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogLevel;

pub fn init_tracing(log_level: &LogLevel) {
    let log_level = &format!("{},hyper=info,r2d2=info", log_level.as_str());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_level(true))
        .init();
}

pub struct Metrics {
    request_counter: Counter<u64>,
    image_counter: Counter<u64>,
    intake_duration: Histogram<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| prometheus::Error::Msg(e.to_string()))?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("image_intake");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let image_counter = meter
            .u64_counter("images_received_total")
            .with_description("Total number of uploaded images")
            .build();

        let boundaries = generate_boundaries((50, 250, 1000, 5000, 30000));

        let intake_duration = meter
            .u64_histogram("intake_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of a whole intake round in milliseconds")
            .build();

        Ok(Metrics {
            request_counter,
            image_counter,
            intake_duration,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_images(&self, count: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.image_counter.add(count, &attributes);
    }

    pub fn record_intake_duration(&self, duration_ms: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.intake_duration.record(duration_ms, &attributes);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 50;
    let middle_step: usize = 125;
    let end_step: usize = 500;
    let tail_step: usize = 5000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
