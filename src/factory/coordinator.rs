//! Agent factory: holds the worker pool at capacity against the candidate
//! queue, claiming items as it dispatches them.

use crate::audit::{AuditLog, actions};
use crate::coordination::{ClaimManager, ClaimOutcome, RateLimiter, StrikeTracker};
use crate::error::Result;
use crate::factory::candidates::CandidateSource;
use crate::factory::runner::AgentRunner;
use crate::factory::worker::{WorkerContext, WorkerEvent, WorkerOutcome, run_worker};
use crate::store::{AgentStore, ContributionStatus, WorkItem, generate_agent_id};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the AgentFactory.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Maximum number of concurrent workers
    pub max_agents: usize,
    /// How often the factory wakes to reap and refill
    pub poll_interval: Duration,
    /// Minimum gap between worker spawns
    pub spawn_stagger: Duration,
    /// Cap on candidates taken per run
    pub max_items: usize,
    /// How long a worker waits for solver budget before requeueing
    pub budget_timeout: Duration,
    /// Times an item may be requeued before it counts as failed
    pub max_requeues: u32,
    /// Model label recorded with each contribution
    pub model: String,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_agents: 4,
            poll_interval: Duration::from_secs(5),
            spawn_stagger: Duration::from_secs(60),
            max_items: 100,
            budget_timeout: Duration::from_secs(300),
            max_requeues: 3,
            model: "sonnet-low".to_string(),
        }
    }
}

/// Counters for one factory run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactoryStats {
    pub started: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub requeued: usize,
    pub failed: usize,
}

/// AgentFactory dispatches workers over a prioritized candidate queue.
pub struct AgentFactory {
    runner: Arc<dyn AgentRunner>,
    source: Arc<dyn CandidateSource>,
    claims: ClaimManager,
    strikes: StrikeTracker,
    ctx: WorkerContext,
    config: FactoryConfig,
    queue: VecDeque<WorkItem>,
    requeues: HashMap<String, u32>,
    running: HashMap<String, (WorkItem, JoinHandle<()>)>,
    events_tx: UnboundedSender<WorkerEvent>,
    events_rx: UnboundedReceiver<WorkerEvent>,
    last_spawn: Option<Instant>,
    stats: FactoryStats,
}

impl AgentFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        source: Arc<dyn CandidateSource>,
        store: Arc<Mutex<AgentStore>>,
        claims: ClaimManager,
        rate: RateLimiter,
        strikes: StrikeTracker,
        audit: AuditLog,
        config: FactoryConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            store,
            claims: claims.clone(),
            rate,
            audit,
            model: config.model.clone(),
            budget_timeout: config.budget_timeout,
        };
        Self {
            runner,
            source,
            claims,
            strikes,
            ctx,
            config,
            queue: VecDeque::new(),
            requeues: HashMap::new(),
            running: HashMap::new(),
            events_tx,
            events_rx,
            last_spawn: None,
            stats: FactoryStats::default(),
        }
    }

    /// Run until the queue is drained and every worker has reported back,
    /// or an interrupt arrives. On interrupt, running workers are aborted
    /// and their claims abandoned so the items free up immediately instead
    /// of waiting out their TTL.
    pub async fn run(&mut self) -> Result<FactoryStats> {
        let mut candidates = self.source.fetch().await?;
        candidates.retain(|item| item.is_workable());
        candidates.truncate(self.config.max_items);
        info!("factory run: {} workable candidates", candidates.len());
        self.queue = candidates.into();

        loop {
            self.tick().await?;
            if self.queue.is_empty() && self.running.is_empty() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down {} workers", self.running.len());
                    self.shutdown();
                    break;
                }
            }
        }

        info!(
            "factory done: {} started, {} succeeded, {} skipped, {} requeued, {} failed",
            self.stats.started,
            self.stats.succeeded,
            self.stats.skipped,
            self.stats.requeued,
            self.stats.failed
        );
        Ok(self.stats.clone())
    }

    /// One scheduling pass: absorb finished workers, then refill free slots.
    async fn tick(&mut self) -> Result<()> {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }

        while self.running.len() < self.config.max_agents {
            if let Some(last) = self.last_spawn
                && last.elapsed() < self.config.spawn_stagger
            {
                break;
            }
            let Some(item) = self.next_eligible().await? else {
                break;
            };
            self.spawn_worker(item).await?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        if self.running.remove(&event.agent_id).is_none() {
            warn!("event from unknown worker {}", event.agent_id);
        }
        match event.outcome {
            WorkerOutcome::Finished(ContributionStatus::Skipped) => self.stats.skipped += 1,
            WorkerOutcome::Finished(ContributionStatus::Failed) => self.stats.failed += 1,
            WorkerOutcome::Finished(_) => self.stats.succeeded += 1,
            WorkerOutcome::Requeued => {
                let count = self.requeues.entry(event.item.work_item.clone()).or_insert(0);
                *count += 1;
                if *count > self.config.max_requeues {
                    warn!("{} requeued too often, dropping", event.item.work_item);
                    self.stats.failed += 1;
                } else {
                    debug!("requeueing {} (attempt {})", event.item.work_item, count);
                    self.stats.requeued += 1;
                    self.queue.push_back(event.item);
                }
            }
            WorkerOutcome::Failed(detail) => {
                warn!("worker failed on {}: {}", event.item.work_item, detail);
                self.stats.failed += 1;
            }
        }
    }

    /// Pop the highest-priority candidate that is on an eligible repo.
    /// Items on cooling-down or excluded repos are dropped, not deferred.
    async fn next_eligible(&mut self) -> Result<Option<WorkItem>> {
        while let Some(item) = self.queue.pop_front() {
            if !self.strikes.is_eligible(&item.repo)? {
                debug!("skipping {}: repo not eligible", item.work_item);
                continue;
            }
            return Ok(Some(item));
        }
        Ok(None)
    }

    async fn spawn_worker(&mut self, item: WorkItem) -> Result<()> {
        let agent_id = generate_agent_id();
        match self.claims.try_claim(&item.work_item, &agent_id).await? {
            ClaimOutcome::Granted(_) => {}
            ClaimOutcome::Denied => {
                // Another process got there first; drop the item
                debug!("{} already claimed elsewhere", item.work_item);
                return Ok(());
            }
        }
        self.ctx
            .audit
            .record(&agent_id, &item.repo, actions::CLAIM_GRANTED, &item.work_item)?;

        info!("spawning worker {} for {}", agent_id, item.work_item);
        let handle = tokio::spawn(run_worker(
            self.ctx.clone(),
            Arc::clone(&self.runner),
            item.clone(),
            agent_id.clone(),
            self.events_tx.clone(),
        ));
        self.running.insert(agent_id, (item, handle));
        self.last_spawn = Some(Instant::now());
        self.stats.started += 1;
        Ok(())
    }

    /// Abort every running worker and free its claim so other processes can
    /// pick the items up immediately.
    pub fn shutdown(&mut self) {
        for (agent_id, (item, handle)) in self.running.drain() {
            handle.abort();
            if let Err(e) = self.claims.abandon(&item.work_item, &agent_id) {
                warn!("failed to abandon {} on shutdown: {}", item.work_item, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CATEGORY_AGENT_API;
    use crate::factory::candidates::StaticCandidates;
    use crate::factory::runner::AttemptOutcome;
    use crate::store::Bucket;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Scripted runner: answers per work item, records call order.
    struct MockRunner {
        outcomes: HashMap<String, AttemptOutcome>,
        calls: Mutex<Vec<String>>,
    }

    impl MockRunner {
        fn new(outcomes: Vec<(&str, AttemptOutcome)>) -> Self {
            Self {
                outcomes: outcomes
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentRunner for MockRunner {
        async fn solve(&self, item: &WorkItem, _agent_id: &str) -> Result<AttemptOutcome> {
            self.calls.lock().unwrap().push(item.work_item.clone());
            Ok(self
                .outcomes
                .get(&item.work_item)
                .cloned()
                .unwrap_or(AttemptOutcome::NoChanges))
        }
    }

    fn item(key: &str, bucket: Bucket, score: f64) -> WorkItem {
        WorkItem {
            work_item: key.to_string(),
            repo: key.split('#').next().unwrap().to_string(),
            number: 1,
            priority_score: score,
            bucket,
            beginner_labeled: false,
            duplicate: false,
            language_ok: true,
        }
    }

    struct Harness {
        store: Arc<Mutex<AgentStore>>,
        claims: ClaimManager,
        rate: RateLimiter,
        strikes: StrikeTracker,
        audit: AuditLog,
        _temp: TempDir,
    }

    fn create_harness(api_budget: i64) -> Harness {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(Mutex::new(AgentStore::open_at(temp.path()).unwrap()));
        let claims = ClaimManager::new(
            Arc::clone(&store),
            3_600_000,
            3,
            Duration::from_millis(10),
        )
        .unwrap();
        let rate = RateLimiter::new(Arc::clone(&store), Duration::from_millis(5));
        rate.register(CATEGORY_AGENT_API, 3_600_000, api_budget).unwrap();
        let strikes =
            StrikeTracker::new(Arc::clone(&store), 10, 7 * 24 * 60 * 60 * 1000).unwrap();
        let audit = AuditLog::new(Arc::clone(&store));
        Harness {
            store,
            claims,
            rate,
            strikes,
            audit,
            _temp: temp,
        }
    }

    fn fast_config() -> FactoryConfig {
        FactoryConfig {
            max_agents: 2,
            poll_interval: Duration::from_millis(5),
            spawn_stagger: Duration::ZERO,
            max_items: 100,
            budget_timeout: Duration::from_millis(30),
            max_requeues: 1,
            model: "test-model".to_string(),
        }
    }

    fn create_factory(
        harness: &Harness,
        runner: Arc<MockRunner>,
        items: Vec<WorkItem>,
        config: FactoryConfig,
    ) -> AgentFactory {
        AgentFactory::new(
            runner,
            Arc::new(StaticCandidates::new(items)),
            Arc::clone(&harness.store),
            harness.claims.clone(),
            harness.rate.clone(),
            harness.strikes.clone(),
            harness.audit.clone(),
            config,
        )
    }

    #[tokio::test]
    async fn test_run_drains_queue_in_priority_order() {
        let harness = create_harness(100);
        let runner = Arc::new(MockRunner::new(vec![(
            "a/b#1",
            AttemptOutcome::PrSubmitted {
                pr_url: "https://github.com/a/b/pull/9".to_string(),
            },
        )]));
        let items = vec![
            item("x/y#5", Bucket::General, 2.0),
            item("a/b#1", Bucket::Sponsor, 1.0),
            item("c/d#2", Bucket::General, 8.0),
        ];
        let mut config = fast_config();
        config.max_agents = 1;

        let mut factory = create_factory(&harness, Arc::clone(&runner), items, config);
        let stats = factory.run().await.unwrap();

        assert_eq!(stats.started, 3);
        assert_eq!(stats.succeeded, 3);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(*calls, vec!["a/b#1", "c/d#2", "x/y#5"]);
    }

    #[tokio::test]
    async fn test_ineligible_repo_is_skipped() {
        let harness = create_harness(100);
        harness.strikes.record_strike("bad/repo").unwrap();

        let runner = Arc::new(MockRunner::new(vec![]));
        let items = vec![
            item("bad/repo#1", Bucket::Sponsor, 1.0),
            item("good/repo#2", Bucket::General, 5.0),
        ];

        let mut factory = create_factory(&harness, Arc::clone(&runner), items, fast_config());
        let stats = factory.run().await.unwrap();

        assert_eq!(stats.started, 1);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(*calls, vec!["good/repo#2"]);
    }

    #[tokio::test]
    async fn test_unworkable_candidates_filtered() {
        let harness = create_harness(100);
        let runner = Arc::new(MockRunner::new(vec![]));
        let mut duplicate = item("a/b#1", Bucket::General, 1.0);
        duplicate.duplicate = true;
        let mut wrong_language = item("c/d#2", Bucket::General, 1.0);
        wrong_language.language_ok = false;
        let items = vec![duplicate, wrong_language, item("e/f#3", Bucket::General, 1.0)];

        let mut factory = create_factory(&harness, Arc::clone(&runner), items, fast_config());
        let stats = factory.run().await.unwrap();

        assert_eq!(stats.started, 1);
    }

    #[tokio::test]
    async fn test_already_claimed_item_dropped() {
        let harness = create_harness(100);
        harness
            .claims
            .try_claim("a/b#1", "other-process")
            .await
            .unwrap();

        let runner = Arc::new(MockRunner::new(vec![]));
        let items = vec![item("a/b#1", Bucket::General, 1.0)];

        let mut factory = create_factory(&harness, Arc::clone(&runner), items, fast_config());
        let stats = factory.run().await.unwrap();

        assert_eq!(stats.started, 0);
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_requeues_then_drops() {
        let harness = create_harness(1);
        // Burn the whole budget so workers always time out
        harness.rate.try_acquire(CATEGORY_AGENT_API, 1).unwrap();

        let runner = Arc::new(MockRunner::new(vec![]));
        let items = vec![item("a/b#1", Bucket::General, 1.0)];
        let mut config = fast_config();
        config.max_requeues = 1;

        let mut factory = create_factory(&harness, Arc::clone(&runner), items, config);
        let stats = factory.run().await.unwrap();

        // First attempt requeues, second exhausts the requeue budget
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.failed, 1);
        assert!(runner.calls.lock().unwrap().is_empty());
        // The claim was abandoned, not left dangling
        assert_eq!(harness.claims.count_active().unwrap(), 0);
    }

    /// Runner that never finishes, standing in for a solver subprocess that
    /// is still working when the operator interrupts.
    struct StallingRunner;

    #[async_trait]
    impl AgentRunner for StallingRunner {
        async fn solve(&self, _item: &WorkItem, _agent_id: &str) -> Result<AttemptOutcome> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_shutdown_abandons_running_claims() {
        let harness = create_harness(100);
        let items = vec![
            item("a/b#1", Bucket::General, 1.0),
            item("c/d#2", Bucket::General, 2.0),
        ];
        let mut factory = AgentFactory::new(
            Arc::new(StallingRunner),
            Arc::new(StaticCandidates::new(items.clone())),
            Arc::clone(&harness.store),
            harness.claims.clone(),
            harness.rate.clone(),
            harness.strikes.clone(),
            harness.audit.clone(),
            fast_config(),
        );

        factory.queue = items.into();
        factory.tick().await.unwrap();
        // Give the workers time to take their budget and stall in the solver
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(factory.running.len(), 2);
        assert_eq!(harness.claims.count_active().unwrap(), 2);

        factory.shutdown();

        assert!(factory.running.is_empty());
        // The claims freed up immediately instead of waiting out their TTL
        assert_eq!(harness.claims.count_active().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_outcomes_recorded_as_contributions() {
        let harness = create_harness(100);
        let runner = Arc::new(MockRunner::new(vec![
            (
                "a/b#1",
                AttemptOutcome::PrSubmitted {
                    pr_url: "https://github.com/a/b/pull/3".to_string(),
                },
            ),
            (
                "c/d#2",
                AttemptOutcome::Skipped {
                    reason: "too large".to_string(),
                },
            ),
            (
                "e/f#3",
                AttemptOutcome::Failed {
                    detail: "exit status Some(1)".to_string(),
                },
            ),
        ]));
        let items = vec![
            item("a/b#1", Bucket::General, 1.0),
            item("c/d#2", Bucket::General, 2.0),
            item("e/f#3", Bucket::General, 3.0),
        ];

        let mut factory = create_factory(&harness, Arc::clone(&runner), items, fast_config());
        let stats = factory.run().await.unwrap();

        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 1);

        let store = harness.store.lock().unwrap();
        let contributions = store.list_contributions(10).unwrap();
        assert_eq!(contributions.len(), 3);
        let submitted = contributions
            .iter()
            .find(|c| c.work_item == "a/b#1")
            .unwrap();
        assert_eq!(submitted.status, ContributionStatus::PrSubmitted);
        assert_eq!(
            submitted.pr_url.as_deref(),
            Some("https://github.com/a/b/pull/3")
        );
        assert_eq!(submitted.model, "test-model");

        // Failed item's claim was abandoned so it can be retried later
        assert_eq!(store.count_active_claims(crate::store::now_ms()).unwrap(), 0);
    }
}
