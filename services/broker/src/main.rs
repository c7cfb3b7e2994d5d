// Broker service main entry point.
use anyhow::{Context, Result};
use broker::{config, observability};
use keel_broker::Broker;
use std::future::Future;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("keel-broker");

    let config = config::BrokerConfig::from_env_or_yaml()?;
    let broker = Broker::open(config.broker_options())
        .await
        .with_context(|| format!("open broker at {}", config.data_dir.display()))?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        topics = broker.topic_names().await.len(),
        "broker started"
    );

    // Expose Prometheus metrics on the configured bind address.
    let metrics_bind = config.metrics_bind;
    let metrics_task = tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    metrics_task.abort();
    broker.stop().await;
    tracing::info!("broker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_on_empty_data_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data_dir = dir.path().join("data");
        let _g1 = EnvGuard::set("KEEL_DATA_DIR", data_dir.to_str().expect("utf-8 path"));
        let _g2 = EnvGuard::set("KEEL_BROKER_METRICS_BIND", "127.0.0.1:0");
        let _g3 = EnvGuard::unset("KEEL_BROKER_CONFIG");
        run_with_shutdown(async {}).await?;
        assert!(data_dir.is_dir());
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_restores_existing_topics() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let broker = Broker::open(keel_broker::BrokerOptions::new(dir.path())).await?;
            let topic = broker.create_topic("orders").await?;
            topic.write(Bytes::from_static(b"kept"))?;
            broker.stop().await;
        }
        let _g1 = EnvGuard::set("KEEL_DATA_DIR", dir.path().to_str().expect("utf-8 path"));
        let _g2 = EnvGuard::set("KEEL_BROKER_METRICS_BIND", "127.0.0.1:0");
        let _g3 = EnvGuard::unset("KEEL_BROKER_CONFIG");
        run_with_shutdown(async {}).await?;

        let broker = Broker::open(keel_broker::BrokerOptions::new(dir.path())).await?;
        let topic = broker.get_topic("orders").await?;
        assert_eq!(topic.last_message_id(), 1);
        broker.stop().await;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_rejects_bad_config() {
        let _g1 = EnvGuard::set("KEEL_BROKER_METRICS_BIND", "nope");
        let _g2 = EnvGuard::unset("KEEL_BROKER_CONFIG");
        assert!(run_with_shutdown(async {}).await.is_err());
    }
}
