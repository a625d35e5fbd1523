//! 'main' for the Agora node process

use agora_common::messages::Message;
use anyhow::Result;
use caryatid_process::Process;
use config::{Config, Environment, File};
use std::sync::Arc;
use tracing::info;

// External modules
use agora_module_block_producer::BlockProducer;
use agora_module_consensus::Consensus;
use agora_module_tx_pool::TxPool;

use caryatid_module_clock::Clock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter, fmt, EnvFilter, Registry};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {
    // Standard logging using RUST_LOG for log levels, default INFO
    let fmt_layer = fmt::layer().with_filter(EnvFilter::from_default_env());

    // Only turn on tracing if some OTEL environment variables exist
    if std::env::vars().any(|(name, _)| name.starts_with("OTEL_")) {
        // Send span tracing to opentelemetry
        // Should pick up standard OTEL_* environment variables
        let otel_exporter = SpanExporter::builder().with_tonic().build()?;
        let otel_tracer = SdkTracerProvider::builder()
            .with_batch_exporter(otel_exporter)
            .build()
            .tracer("rust-otel-otlp");
        let otel_layer = OpenTelemetryLayer::new(otel_tracer)
            .with_filter(
                EnvFilter::from_default_env().add_directive(filter::LevelFilter::INFO.into()),
            )
            .with_filter(filter::filter_fn(|meta| meta.is_span()));
        Registry::default().with(fmt_layer).with(otel_layer).init();
    } else {
        Registry::default().with(fmt_layer).init();
    }

    info!("Agora node process");

    // Read the config
    let config = Arc::new(
        Config::builder()
            .add_source(File::with_name("node"))
            .add_source(Environment::with_prefix("AGORA"))
            .build()
            .unwrap(),
    );

    // Create the process
    let mut process = Process::<Message>::create(config).await;

    // Register modules
    TxPool::register(&mut process);
    Consensus::register(&mut process);
    BlockProducer::register(&mut process);

    Clock::<Message>::register(&mut process);

    // Run it
    process.run().await?;

    // Bye!
    info!("Exiting");
    Ok(())
}
