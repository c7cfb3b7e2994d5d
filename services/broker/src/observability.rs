//! Tracing and metrics for the broker process.
//!
//! Installs a `tracing` subscriber filtered by `RUST_LOG` (default `info`) and a
//! Prometheus recorder that collects the engine's `keel_*` counters and gauges.
//! [`serve_metrics`] exposes them over HTTP together with `/live` and `/ready`
//! probes.

use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
#[cfg(any(test, feature = "test-util"))]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(any(test, feature = "test-util"))]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes logging and the metrics recorder and returns the handle used to
/// render metrics.
pub fn init_observability(service_name: &str) -> PrometheusHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));
    tracing::debug!(service = service_name, "observability initialized");
    install_metrics_recorder()
}

/// Serves Prometheus metrics and health endpoints on the given socket address.
///
/// Returns an I/O error if binding or serving fails.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");
    axum::serve(listener, router(handle).into_make_service()).await
}

fn router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }))
}

// Tests share one process-wide recorder.
fn install_metrics_recorder() -> PrometheusHandle {
    #[cfg(any(test, feature = "test-util"))]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return handle.clone();
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder");
        let _ = METRICS_HANDLE.set(handle.clone());
        handle
    }
    #[cfg(not(any(test, feature = "test-util")))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(any(test, feature = "test-util"))]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(any(test, feature = "test-util")))]
    {
        subscriber.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn recorder_is_cached_in_tests() {
        let first = install_metrics_recorder();
        // A second install in the same process must not panic.
        let second = install_metrics_recorder();
        let _ = (first.render(), second.render());
    }

    #[tokio::test]
    #[serial]
    async fn engine_metrics_carry_the_topic_label() {
        let handle = init_observability("keel-broker-test");
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = keel_broker::BrokerOptions::new(dir.path());
        options.topic.persist_interval = std::time::Duration::from_millis(5);
        let broker = keel_broker::Broker::open(options).await.expect("open");
        let topic = broker.create_topic("labelled").await.expect("create");
        let handler = keel_broker::ack_handler(|_| async { Ok(()) });
        let writer = topic
            .create_writer(
                Some(handler),
                keel_broker::WriterOptions {
                    confirmation_interval: std::time::Duration::from_millis(5),
                },
            )
            .expect("writer");
        writer
            .write(keel_broker::WriteRequest {
                sequence_number: 1,
                payload: bytes::Bytes::from_static(b"m"),
            })
            .expect("write");

        let labelled = ["keel_messages_written_total", "keel_acks_sent_total"]
            .map(|metric| format!("{metric}{{topic=\"labelled\"}}"));
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !labelled.iter().all(|series| handle.render().contains(series)) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("labelled series rendered");
        writer.dispose().await;
        broker.stop().await;
    }

    #[tokio::test]
    #[serial]
    async fn endpoints_respond() {
        let handle = init_observability("keel-broker-test");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(handle).into_make_service()).await;
        });

        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .expect("client");
        let metrics = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("metrics");
        assert_eq!(metrics.status(), 200);
        for endpoint in ["live", "ready"] {
            let response = client
                .get(format!("http://{addr}/{endpoint}"))
                .send()
                .await
                .expect("health endpoint");
            assert_eq!(response.status(), 200);
            assert_eq!(response.text().await.expect("body"), "ok");
        }
    }
}
