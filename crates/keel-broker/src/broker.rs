// Registry of the topics living under one data directory.
use std::path::PathBuf;
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use keel_common::validate_name;
use keel_storage::{TopicCatalog, TopicRecord};
use tokio::sync::RwLock;

use crate::options::BrokerOptions;
use crate::topic::Topic;
use crate::{BrokerError, Result};

/// Opens, creates and deletes topics and keeps `topics.json` in step.
///
/// ```
/// use bytes::Bytes;
/// use keel_broker::{Broker, BrokerOptions};
///
/// let dir = tempfile::tempdir().expect("tempdir");
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = Broker::open(BrokerOptions::new(dir.path()))
///         .await
///         .expect("open");
///     let topic = broker.create_topic("orders").await.expect("create");
///     let written = topic.write(Bytes::from_static(b"hello")).expect("write");
///     assert_eq!(written.last_inserted_id, 1);
///     broker.stop().await;
/// });
/// ```
pub struct Broker {
    options: BrokerOptions,
    catalog: TopicCatalog,
    // Topic name -> running topic.
    topics: RwLock<HashMap<String, Arc<Topic>, RandomState>>,
}

impl Broker {
    /// Restores and starts every topic recorded in the data directory.
    pub async fn open(options: BrokerOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.data_dir).map_err(keel_storage::StorageError::from)?;
        let catalog = TopicCatalog::new(&options.data_dir);
        let records = catalog.load()?;
        let mut topics: HashMap<String, Arc<Topic>, RandomState> =
            HashMap::with_hasher(RandomState::new());
        for record in records {
            let topic = Topic::open(
                record.name.clone(),
                &options.data_dir.join(&record.name),
                options.topic.clone(),
            );
            if let Err(err) = topic.restore().and_then(|()| topic.start()) {
                tracing::error!(topic = %record.name, error = %err, "topic failed to come up");
                for started in topics.values() {
                    if let Err(stop_err) = started.stop(false).await {
                        tracing::warn!(topic = %started.name(), error = %stop_err, "topic stop failed");
                    }
                }
                return Err(err);
            }
            topics.insert(record.name, topic);
        }
        tracing::info!(
            data_dir = %options.data_dir.display(),
            topics = topics.len(),
            "broker opened"
        );
        Ok(Self {
            options,
            catalog,
            topics: RwLock::new(topics),
        })
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub async fn create_topic(&self, name: &str) -> Result<Arc<Topic>> {
        validate_name(name)?;
        let mut topics = self.topics.write().await;
        if topics.contains_key(name) {
            return Err(BrokerError::TopicExists(name.to_string()));
        }
        let directory = self.topic_dir(name);
        std::fs::create_dir_all(&directory).map_err(keel_storage::StorageError::from)?;
        let topic = Topic::open(name, &directory, self.options.topic.clone());
        topic.restore()?;
        topic.start()?;
        let mut records = Self::records(&topics);
        records.push(TopicRecord {
            name: name.to_string(),
        });
        records.sort_by(|a, b| a.name.cmp(&b.name));
        if let Err(err) = self.catalog.store(&records) {
            let _ = topic.stop(false).await;
            return Err(err.into());
        }
        topics.insert(name.to_string(), Arc::clone(&topic));
        tracing::info!(topic = name, "topic created");
        Ok(topic)
    }

    /// Stops a topic and removes its files. Unless `delete_subscriptions` is
    /// set, a topic that still has subscriptions is left untouched.
    pub async fn delete_topic(&self, name: &str, delete_subscriptions: bool) -> Result<()> {
        let mut topics = self.topics.write().await;
        let topic = topics
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))?;
        topic.stop(!delete_subscriptions).await?;
        topics.remove(name);
        self.catalog.store(&Self::records(&topics))?;
        drop(topics);
        let directory = self.topic_dir(name);
        if let Err(err) = std::fs::remove_dir_all(&directory)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            return Err(keel_storage::StorageError::from(err).into());
        }
        tracing::info!(topic = name, "topic deleted");
        Ok(())
    }

    pub async fn get_topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.topics
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))
    }

    pub async fn topic_exists(&self, name: &str) -> bool {
        self.topics.read().await.contains_key(name)
    }

    /// Topic names in lexical order.
    pub async fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops every topic. Topics stay registered on disk and come back on
    /// the next [`Broker::open`].
    pub async fn stop(&self) {
        let topics: Vec<_> = self.topics.write().await.drain().map(|(_, topic)| topic).collect();
        for topic in topics {
            if let Err(err) = topic.stop(false).await {
                tracing::warn!(topic = %topic.name(), error = %err, "topic stop failed");
            }
        }
        tracing::info!("broker stopped");
    }

    fn topic_dir(&self, name: &str) -> PathBuf {
        self.options.data_dir.join(name)
    }

    fn records(topics: &HashMap<String, Arc<Topic>, RandomState>) -> Vec<TopicRecord> {
        let mut records: Vec<_> = topics
            .keys()
            .map(|name| TopicRecord { name: name.clone() })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("data_dir", &self.options.data_dir)
            .finish_non_exhaustive()
    }
}
