//! Custom metric evaluation against layered scopes.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use foreman_backends_core::{Clock, CustomMetric, MetricValue, MetricsSink};
use foreman_model::{Metrics, NodeStatus, PrometheusMetric, Template};

use crate::scope::{substitute_params, RealtimeThunk};

use super::WorkflowOperation;

fn strip_reference(value: &str) -> &str {
    value
        .trim()
        .trim_start_matches("{{")
        .trim_end_matches("}}")
        .trim()
}

impl<'a> WorkflowOperation<'a> {
    /// Registers workflow-level real-time gauges at workflow start.
    pub(crate) fn register_realtime_workflow_metrics(&mut self, metrics: &Metrics) {
        let clock = Arc::clone(&self.operator.c.clock);
        let started = self.wf.status.started_at.unwrap_or_else(|| clock.now());
        let mut realtime: BTreeMap<String, RealtimeThunk> = BTreeMap::new();
        realtime.insert(
            "workflow.duration".to_string(),
            Arc::new(move || (clock.now() - started).num_milliseconds() as f64 / 1000.0),
        );
        self.compute_metrics(&metrics.prometheus, &BTreeMap::new(), &realtime, true);
    }

    /// Emits workflow-level metrics after the terminal phase is known.
    pub(crate) fn emit_workflow_metrics(&mut self, metrics: &Metrics, entry_node: &NodeStatus) {
        let mut local = BTreeMap::new();
        if let (Some(started), Some(finished)) = (entry_node.started_at, entry_node.finished_at) {
            local.insert(
                "workflow.duration".to_string(),
                format!("{:.6}", (finished - started).num_milliseconds() as f64 / 1000.0),
            );
        }
        self.compute_metrics(&metrics.prometheus, &local, &BTreeMap::new(), false);
    }

    pub(crate) fn emit_node_realtime_metrics(&mut self, template: &Template, node: &NodeStatus) {
        let Some(metrics) = template.metrics.clone() else {
            return;
        };
        let (local, realtime) = self.prepare_metric_scope(node);
        self.compute_metrics(&metrics.prometheus, &local, &realtime, true);
    }

    pub(crate) fn emit_node_completion_metrics(&mut self, template: &Template, node: &NodeStatus) {
        let Some(metrics) = template.metrics.clone() else {
            return;
        };
        let (local, realtime) = self.prepare_metric_scope(node);
        self.compute_metrics(&metrics.prometheus, &local, &realtime, false);
    }

    fn prepare_metric_scope(
        &self,
        node: &NodeStatus,
    ) -> (BTreeMap<String, String>, BTreeMap<String, RealtimeThunk>) {
        let mut local = BTreeMap::new();
        local.insert("status".to_string(), node.phase.to_string());
        local.insert("retries".to_string(), node.children.len().to_string());
        if let Some(started) = node.started_at {
            let end = node.finished_at.unwrap_or_else(|| self.now());
            local.insert(
                "duration".to_string(),
                format!("{:.6}", (end - started).num_milliseconds() as f64 / 1000.0),
            );
        }
        if let Some(outputs) = &node.outputs {
            if let Some(result) = &outputs.result {
                local.insert("outputs.result".to_string(), result.clone());
            }
            if let Some(exit_code) = &outputs.exit_code {
                local.insert("exitCode".to_string(), exit_code.clone());
            }
            for parameter in &outputs.parameters {
                if let Some(value) = &parameter.value {
                    local.insert(
                        format!("outputs.parameters.{}", parameter.name),
                        value.clone(),
                    );
                }
            }
        }

        let mut realtime: BTreeMap<String, RealtimeThunk> = BTreeMap::new();
        if let Some(started) = node.started_at {
            let clock = Arc::clone(&self.operator.c.clock);
            realtime.insert(
                "duration".to_string(),
                Arc::new(move || (clock.now() - started).num_milliseconds() as f64 / 1000.0),
            );
        }
        (local, realtime)
    }

    /// One pass over the metric list: the real-time pass registers gauges
    /// backed by thunks, the completion pass evaluates concrete values.
    fn compute_metrics(
        &mut self,
        metrics: &[PrometheusMetric],
        local: &BTreeMap<String, String>,
        realtime: &BTreeMap<String, RealtimeThunk>,
        realtime_pass: bool,
    ) {
        for metric in metrics {
            if metric.is_realtime() != realtime_pass {
                continue;
            }
            let substitute = |text: &str| {
                substitute_params(text, true, |key| {
                    local
                        .get(key)
                        .cloned()
                        .or_else(|| self.scope.lookup(key).map(str::to_string))
                })
                .unwrap_or_else(|_| text.to_string())
            };
            let mut labels = BTreeMap::new();
            for label in &metric.labels {
                labels.insert(label.key.clone(), substitute(&label.value));
            }
            let label_desc: Vec<String> = labels
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            let key = format!("{}{{{}}}", metric.name, label_desc.join(","));

            let value = if realtime_pass {
                let Some(gauge) = &metric.gauge else {
                    continue;
                };
                let reference = strip_reference(&gauge.value);
                let Some(thunk) = realtime.get(reference).cloned() else {
                    warn!(metric = %metric.name, reference, "real-time metric references an unknown variable");
                    continue;
                };
                MetricValue::RealtimeGauge(thunk)
            } else {
                let raw = match (&metric.gauge, &metric.counter) {
                    (Some(gauge), _) => substitute(&gauge.value),
                    (None, Some(counter)) => substitute(&counter.value),
                    (None, None) => continue,
                };
                let Ok(parsed) = raw.parse::<f64>() else {
                    warn!(metric = %metric.name, value = %raw, "metric value did not evaluate to a number");
                    continue;
                };
                if metric.counter.is_some() && metric.gauge.is_none() {
                    let previous = match self.operator.c.metrics.get_custom_metric(&key) {
                        Some(CustomMetric {
                            value: MetricValue::Counter(previous),
                            ..
                        }) => previous,
                        _ => 0.0,
                    };
                    MetricValue::Counter(previous + parsed)
                } else {
                    MetricValue::Gauge(parsed)
                }
            };

            self.operator.c.metrics.upsert_custom_metric(
                &key,
                CustomMetric {
                    name: metric.name.clone(),
                    help: metric.help.clone(),
                    labels,
                    value,
                },
            );
        }
    }
}
