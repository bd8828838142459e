//! Agent context: the process-wide services, built once at startup and shared by the
//! signal bus, the join orchestrator and the maintenance loop.

use crate::bus::BusCipher;
use crate::classifier::{Classifier, EmojiPolicy};
use crate::config::VigilConfig;
use crate::entities::EntityStore;
use crate::error::VigilResult;
use crate::normalizer::{ScriptConverter, SpecialTable, TextNormalizer};
use crate::persistence::StateBackend;
use crate::rules::{default_categories, RuleStore};
use crate::transport::Transport;
use std::sync::Arc;

pub struct AgentContext {
    pub config: VigilConfig,
    pub normalizer: Arc<TextNormalizer>,
    pub rules: Arc<RuleStore>,
    pub entities: Arc<EntityStore>,
    pub classifier: Arc<Classifier>,
    pub cipher: BusCipher,
    pub transport: Arc<dyn Transport>,
}

impl AgentContext {
    /// Load state from `backend` and wire the services together. Fails only on an
    /// unusable bus key.
    pub fn build(
        config: VigilConfig,
        backend: Arc<dyn StateBackend>,
        transport: Arc<dyn Transport>,
        converter: Arc<dyn ScriptConverter>,
    ) -> VigilResult<Arc<Self>> {
        let cipher = BusCipher::new(&config.bus_key_bytes()?)?;

        let mut categories = default_categories();
        categories.extend(config.extra_categories.iter().cloned());
        let rules = Arc::new(RuleStore::open(Arc::clone(&backend), categories));

        let entities = Arc::new(EntityStore::open(
            backend,
            config.bot_ids.iter().copied(),
            config.score_threshold,
        ));
        let normalizer = Arc::new(TextNormalizer::new(config.normalize, config.folds_script(), converter));
        let classifier = Arc::new(Classifier::new(
            Arc::clone(&rules),
            Arc::clone(&entities),
            EmojiPolicy::from_config(&config.emoji),
        ));

        let ctx = Self {
            config,
            normalizer,
            rules,
            entities,
            classifier,
            cipher,
            transport,
        };
        ctx.rebuild_special_tables();
        tracing::info!(
            target: "vigil::context",
            agent = %ctx.config.agent_name,
            categories = ctx.rules.categories().len(),
            "agent context ready"
        );
        Ok(Arc::new(ctx))
    }

    /// Rebuild one substitution table from its rule category.
    pub fn rebuild_special_table(&self, table: SpecialTable) {
        match self.rules.patterns(table.category()) {
            Ok(patterns) => {
                self.normalizer.rebuild_table(table, &patterns);
            }
            Err(e) => {
                tracing::warn!(target: "vigil::context", table = table.category(), error = %e, "substitution table not rebuilt");
            }
        }
    }

    pub fn rebuild_special_tables(&self) {
        self.rebuild_special_table(SpecialTable::Character);
        self.rebuild_special_table(SpecialTable::Emoji);
    }

    /// Fetch a group's admin roster and trusted set through the transport.
    pub async fn refresh_group(&self, gid: i64) -> VigilResult<()> {
        let roster = self.transport.group_roster(gid).await?;
        self.entities.set_admins(gid, roster.admins)?;
        self.entities.set_trusted(gid, roster.trusted)?;
        Ok(())
    }

    /// Refresh every group in `groups`; failures are logged and skipped. Returns the
    /// number refreshed.
    pub async fn refresh_groups(&self, groups: &[i64]) -> usize {
        let mut refreshed = 0;
        for &gid in groups {
            match self.refresh_group(gid).await {
                Ok(()) => refreshed += 1,
                Err(e) => {
                    tracing::warn!(target: "vigil::context", group_id = gid, error = %e, "roster refresh failed");
                }
            }
        }
        refreshed
    }

    pub fn agent_name(&self) -> &str {
        &self.config.agent_name
    }
}
