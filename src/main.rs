use std::sync::Arc;
use std::time::Duration;

use lp_sender::{
    config::{AppConfig, DeviceEnv, SenderConfig},
    models::sample::DatedImage,
    services::{
        notifier::{ActcastNotifier, Notifier},
        queue::QueuePolicy,
        sender::DataSender,
        token::{Rs256Signer, Signer},
        worker::Task,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let device = DeviceEnv::from_env().expect("Failed to read device environment");

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        metrics::describe_counter!("sender_samples_total", "Samples finalized, by outcome");
        metrics::describe_counter!("sender_attempts_total", "Upload attempts made");
        metrics::describe_counter!(
            "sender_token_refresh_total",
            "Data collect token requests, by result"
        );
        metrics::describe_counter!("work_queue_rejected_total", "Items refused by a work queue");
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    let signer: Arc<dyn Signer> = Arc::new(
        Rs256Signer::from_file(&config.signing_key_path).expect("Failed to load signing key"),
    );
    let notifier: Arc<dyn Notifier> = Arc::new(ActcastNotifier::stdout());

    let sender_config =
        SenderConfig::from_app(&config, device).expect("LP_USER_METADATA is not a JSON object");
    let validated = sender_config.validate();
    tracing::info!(
        pipeline_id = %validated.config.pipeline_id,
        sending_enabled = validated.sending_enabled(),
        "Initializing lp-sender"
    );

    let sender = DataSender::new(validated, signer, notifier)
        .expect("Failed to build HTTP client");
    let mut task = sender.into_task(QueuePolicy::from_size(config.queue_size));
    task.start().expect("Failed to start sender task");

    for path in std::env::args().skip(1) {
        match image::open(&path) {
            Ok(image) => {
                if !task.enqueue(DatedImage::now(image)) {
                    tracing::warn!(%path, "Sending queue is full, image skipped");
                }
            }
            Err(e) => tracing::error!(%path, error = %e, "Failed to open image"),
        }
    }

    task.close();
    if let Err(e) = task.join(Some(Duration::from_secs(config.join_timeout_secs))) {
        tracing::error!(error = %e, "Sender task did not finish cleanly");
        task.stop();
        std::process::exit(1);
    }
    tracing::info!("All samples processed");
}
