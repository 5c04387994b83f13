//! Memoization: consult the cache on first sight of a memoized node.

use tracing::{debug, info};

use foreman_backends_core::{BackendError, Cache, CacheFactory};
use foreman_model::{MemoizationStatus, NodePhase, NodeStatus, Template, TemplateHolder};

use crate::config::parse_duration;
use crate::error::OperateError;

use super::execute::node_type_for;
use super::{ExecuteOpts, WorkflowOperation};

impl<'a> WorkflowOperation<'a> {
    /// Looks the template's key up in its cache and initializes the node
    /// accordingly: already Succeeded with the cached outputs on a hit,
    /// Pending with a pending memoization status on a miss.
    pub(crate) async fn consult_memoization_cache(
        &mut self,
        node_name: &str,
        template_scope: &str,
        template: &Template,
        holder: &TemplateHolder,
        opts: &ExecuteOpts,
    ) -> Result<NodeStatus, OperateError> {
        let memoize = template
            .memoize
            .clone()
            .ok_or_else(|| OperateError::InvariantViolation("memoize config missing".to_string()))?;
        let cache = self
            .operator
            .c
            .caches
            .cache(&memoize.cache_name)
            .ok_or_else(|| {
                OperateError::Backend(BackendError::Message(format!(
                    "cache {} could not be found or created",
                    memoize.cache_name
                )))
            })?;
        let entry = cache.load(&memoize.key).await?;
        let now = self.now();

        let mut outputs = None;
        let hit = match &entry {
            Some(entry) => match &memoize.max_age {
                Some(raw) => {
                    let max_age = parse_duration(raw).map_err(|err| {
                        OperateError::Validation(format!("invalid maxAge: {err}"))
                    })?;
                    match entry.outputs_with_max_age(max_age, now) {
                        Some(fresh) => {
                            outputs = Some(fresh.clone());
                            true
                        }
                        // entry expired; treat as a miss
                        None => false,
                    }
                }
                None => {
                    outputs = Some(entry.outputs().clone());
                    entry.hit()
                }
            },
            None => false,
        };

        let memoization_status = MemoizationStatus {
            hit,
            key: memoize.key.clone(),
            cache_name: memoize.cache_name.clone(),
        };

        let node_id = self.wf.node_id(node_name);
        if hit {
            info!(node = %node_name, key = %memoize.key, "memoization cache hit");
            self.initialize_executable_node(
                node_name,
                node_type_for(template),
                template_scope,
                template,
                holder,
                &opts.boundary_id,
                NodePhase::Succeeded,
                "",
            );
            let node = self
                .wf
                .status
                .nodes
                .get_mut(&node_id)
                .expect("cache-hit node initialized above");
            node.outputs = outputs;
            node.finished_at = Some(now);
            node.memoization_status = Some(memoization_status);
            let snapshot = node.clone();
            self.updated = true;
            return Ok(snapshot);
        }

        debug!(node = %node_name, key = %memoize.key, "memoization cache miss");
        self.initialize_executable_node(
            node_name,
            node_type_for(template),
            template_scope,
            template,
            holder,
            &opts.boundary_id,
            NodePhase::Pending,
            "",
        );
        let node = self
            .wf
            .status
            .nodes
            .get_mut(&node_id)
            .expect("cache-miss node initialized above");
        node.memoization_status = Some(memoization_status);
        let snapshot = node.clone();
        self.updated = true;
        Ok(snapshot)
    }
}
