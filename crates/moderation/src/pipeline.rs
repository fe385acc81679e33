//! Wiring of the moderation groups into one process
//!
//! The filter group reads both tables through views. When it is selected,
//! the views are started first and given a bounded time to catch up before
//! chat messages are consumed, so a restarted filter does not forward
//! messages that an already persisted block or ban would have stopped.

use chatflow_config::ChatflowConfig;
use chatflow_types::BlockList;
use processor::state::{table_topic, MemoryStateBackend, SledConfig, SledStateBackend, StateBackend};
use processor::{
    Broker, BoolCodec, GroupGraph, JsonCodec, Processor, ProcessorConfig, ProcessorError,
    ProcessorStats, SnapshotStore, View,
};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ModerationError, Result};
use crate::groups::{ban_group, block_group, filter_group};
use crate::topics::Topics;

const VIEW_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// One of the moderation processing groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKind {
    Block,
    Ban,
    Filter,
}

impl GroupKind {
    pub const ALL: [GroupKind; 3] = [GroupKind::Block, GroupKind::Ban, GroupKind::Filter];
}

impl FromStr for GroupKind {
    type Err = ModerationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(GroupKind::Block),
            "ban" => Ok(GroupKind::Ban),
            "filter" => Ok(GroupKind::Filter),
            other => Err(ModerationError::UnknownGroup(other.to_string())),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupKind::Block => "block",
            GroupKind::Ban => "ban",
            GroupKind::Filter => "filter",
        };
        f.write_str(name)
    }
}

/// Runs a selection of the moderation groups against one broker
pub struct Pipeline {
    broker: Arc<dyn Broker>,
    settings: ChatflowConfig,
    topics: Topics,
    view_timeout: Duration,
}

impl Pipeline {
    pub fn new(broker: Arc<dyn Broker>, settings: ChatflowConfig) -> Result<Self> {
        settings.validate()?;
        let topics = Topics::new(&settings.topics)?;
        Ok(Self {
            broker,
            settings,
            topics,
            view_timeout: VIEW_RECOVERY_TIMEOUT,
        })
    }

    /// Bound on the initial catch-up of the filter's views
    pub fn with_view_timeout(mut self, timeout: Duration) -> Self {
        self.view_timeout = timeout;
        self
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Run `groups` until `token` is cancelled or one of them fails
    pub async fn run(&self, groups: &[GroupKind], token: CancellationToken) -> Result<()> {
        self.start(groups, token).await?.wait().await
    }

    /// Start `groups` in the background
    pub async fn start(&self, groups: &[GroupKind], token: CancellationToken) -> Result<RunningPipeline> {
        if groups.is_empty() {
            return Err(ModerationError::Config(chatflow_config::ConfigError::ValidationError(
                "no processing group selected".to_string(),
            )));
        }

        let partitions = self.settings.broker.default_partitions;
        self.topics.ensure(self.broker.as_ref(), partitions).await?;

        let config = ProcessorConfig::from_settings(&self.settings);
        let snapshots = self.snapshot_store().await?;
        let token = token.child_token();
        let mut running = RunningPipeline {
            tasks: JoinSet::new(),
            token: token.clone(),
            blocked_users: None,
            banned_words: None,
            stats: BTreeMap::new(),
        };

        if groups.contains(&GroupKind::Filter) {
            let (blocked, banned) = self.start_views(&mut running).await?;
            let graph = filter_group(&self.topics, blocked, banned)?;
            self.spawn(&mut running, GroupKind::Filter, graph, &config, &snapshots);
        }
        if groups.contains(&GroupKind::Block) {
            let graph = block_group(&self.topics)?;
            self.spawn(&mut running, GroupKind::Block, graph, &config, &snapshots);
        }
        if groups.contains(&GroupKind::Ban) {
            let graph = ban_group(&self.topics)?;
            self.spawn(&mut running, GroupKind::Ban, graph, &config, &snapshots);
        }

        let names: Vec<String> = groups.iter().map(GroupKind::to_string).collect();
        info!(groups = ?names, partitions, "moderation pipeline started");
        Ok(running)
    }

    async fn snapshot_store(&self) -> Result<SnapshotStore> {
        let backend: Arc<dyn StateBackend> = match &self.settings.state.snapshot_dir {
            Some(dir) => {
                let backend = SledStateBackend::open(SledConfig::new(dir))
                    .await
                    .map_err(ProcessorError::from)?;
                info!(path = %dir.display(), "using sled snapshot store");
                Arc::new(backend)
            }
            None => Arc::new(MemoryStateBackend::new()),
        };
        Ok(SnapshotStore::new(backend))
    }

    async fn start_views(&self, running: &mut RunningPipeline) -> Result<(View<BlockList>, View<bool>)> {
        let names = self.topics.names();
        self.ensure_table(&names.blocked_users_group, self.topics.blocked_users.name())
            .await?;
        self.ensure_table(&names.banned_words_group, self.topics.banned_words.name())
            .await?;

        let blocked = View::of_group(
            Arc::clone(&self.broker),
            &names.blocked_users_group,
            Arc::new(JsonCodec::<BlockList>::new()),
        );
        let banned = View::of_group(Arc::clone(&self.broker), &names.banned_words_group, Arc::new(BoolCodec));

        info!(tables = ?[blocked.topic(), banned.topic()], "starting views");
        spawn_view(&mut running.tasks, blocked.clone(), running.token.clone());
        spawn_view(&mut running.tasks, banned.clone(), running.token.clone());

        let recovered = tokio::join!(
            blocked.wait_recovered(self.view_timeout),
            banned.wait_recovered(self.view_timeout)
        );
        if !(recovered.0 && recovered.1) {
            warn!(
                timeout_ms = self.view_timeout.as_millis() as u64,
                "views did not catch up in time, filtering with partial tables"
            );
        }

        running.blocked_users = Some(blocked.clone());
        running.banned_words = Some(banned.clone());
        Ok((blocked, banned))
    }

    /// Create the table of `group` with the partition count of its input
    async fn ensure_table(&self, group: &str, input: &str) -> Result<()> {
        let partitions = self
            .broker
            .partition_count(input)
            .await
            .map_err(ProcessorError::from)?;
        self.broker
            .create_topic(&table_topic(group), partitions, true)
            .await
            .map_err(ProcessorError::from)?;
        Ok(())
    }

    fn spawn<V: Clone + Send + Sync + 'static>(
        &self,
        running: &mut RunningPipeline,
        kind: GroupKind,
        graph: GroupGraph<V>,
        config: &ProcessorConfig,
        snapshots: &SnapshotStore,
    ) {
        let processor = Processor::new(Arc::clone(&self.broker), graph, config.clone())
            .with_snapshots(snapshots.clone());
        running.stats.insert(kind, processor.stats());

        let token = running.token.clone();
        running.tasks.spawn(async move {
            processor.run(token).await.map_err(ModerationError::from)
        });
    }
}

fn spawn_view<V: Clone + Send + Sync + 'static>(
    tasks: &mut JoinSet<Result<()>>,
    view: View<V>,
    token: CancellationToken,
) {
    tasks.spawn(async move { view.run(token).await.map_err(ModerationError::from) });
}

/// Handle of a started [`Pipeline`]
pub struct RunningPipeline {
    tasks: JoinSet<Result<()>>,
    token: CancellationToken,
    blocked_users: Option<View<BlockList>>,
    banned_words: Option<View<bool>>,
    stats: BTreeMap<GroupKind, Arc<ProcessorStats>>,
}

impl RunningPipeline {
    /// The filter's view of the block lists, if the filter group runs
    pub fn blocked_users(&self) -> Option<&View<BlockList>> {
        self.blocked_users.as_ref()
    }

    /// The filter's view of the banned words, if the filter group runs
    pub fn banned_words(&self) -> Option<&View<bool>> {
        self.banned_words.as_ref()
    }

    pub fn stats(&self, kind: GroupKind) -> Option<Arc<ProcessorStats>> {
        self.stats.get(&kind).cloned()
    }

    /// Ask every group and view to stop
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Wait for every task to finish.
    ///
    /// The first failure cancels the remaining groups and is returned once
    /// they stopped.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.map_err(|e| ModerationError::Task(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                error!(error = %e, "moderation task failed, stopping pipeline");
                self.token.cancel();
                first_error.get_or_insert(e);
            }
        }

        if let Some(view) = &self.blocked_users {
            view.stop();
        }
        if let Some(view) = &self.banned_words {
            view.stop();
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("moderation pipeline stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_kind_parsing() {
        assert_eq!("block".parse::<GroupKind>().unwrap(), GroupKind::Block);
        assert_eq!(" Filter ".parse::<GroupKind>().unwrap(), GroupKind::Filter);
        assert!(matches!(
            "join".parse::<GroupKind>(),
            Err(ModerationError::UnknownGroup(name)) if name == "join"
        ));
        assert_eq!(GroupKind::Ban.to_string(), "ban");
    }

    #[tokio::test]
    async fn test_rejects_empty_selection() {
        let broker = Arc::new(processor::MemoryBroker::new(1));
        let pipeline = Pipeline::new(broker, ChatflowConfig::default()).unwrap();
        let result = pipeline.start(&[], CancellationToken::new()).await;
        assert!(matches!(result, Err(ModerationError::Config(_))));
    }
}
