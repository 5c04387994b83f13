//! Template resolution, defaults merging, and argument processing.

use std::collections::BTreeMap;
use std::fmt;

use foreman_backends_core::TemplateStore;
use foreman_model::{Arguments, Template, TemplateDefaults, TemplateHolder, WorkflowSpec};

use crate::error::OperateError;
use crate::scope::{substitute_params, Scope};

/// Where template-name lookups resolve from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TemplateScope {
    Local,
    Namespaced(String),
    Cluster(String),
}

impl fmt::Display for TemplateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateScope::Local => f.write_str("local"),
            TemplateScope::Namespaced(name) => write!(f, "namespaced/{name}"),
            TemplateScope::Cluster(name) => write!(f, "cluster/{name}"),
        }
    }
}

/// Resolution context: the template table of the current base document plus
/// the scope it came from. Steps/DAG recursion threads a fresh context when a
/// `templateRef` crosses into another document.
#[derive(Clone)]
pub struct TemplateContext {
    scope: TemplateScope,
    templates: Vec<Template>,
}

impl TemplateContext {
    pub fn new(scope: TemplateScope, templates: Vec<Template>) -> Self {
        Self { scope, templates }
    }

    pub fn scope(&self) -> &TemplateScope {
        &self.scope
    }

    fn storage_key(&self, template_name: &str) -> String {
        format!("{}/{template_name}", self.scope)
    }

    /// Resolves a holder to a concrete template.
    ///
    /// Externally referenced templates are captured into `stored_templates`
    /// at first reference and served from there afterwards, so the executed
    /// template cannot drift under the workflow. Returns the context nested
    /// resolution continues in, the template, and whether storage grew.
    pub async fn resolve(
        &self,
        holder: &TemplateHolder,
        store: &dyn TemplateStore,
        namespace: &str,
        stored_templates: &mut BTreeMap<String, Template>,
    ) -> Result<(TemplateContext, Template, bool), OperateError> {
        if let Some(reference) = holder.template_ref() {
            let (scope, document) = if reference.cluster_scope {
                (
                    TemplateScope::Cluster(reference.name.clone()),
                    store.get_cluster_workflow_template(&reference.name).await?,
                )
            } else {
                (
                    TemplateScope::Namespaced(reference.name.clone()),
                    store
                        .get_workflow_template(namespace, &reference.name)
                        .await?,
                )
            };
            let context = TemplateContext::new(scope, document.spec.templates.clone());
            let key = context.storage_key(&reference.template);
            let mut newly_stored = false;
            if !stored_templates.contains_key(&key) {
                let template = document
                    .spec
                    .template(&reference.template)
                    .cloned()
                    .ok_or_else(|| {
                        OperateError::Validation(format!(
                            "template {} not found in workflow template {}",
                            reference.template, reference.name
                        ))
                    })?;
                stored_templates.insert(key.clone(), template);
                newly_stored = true;
            }
            let template = stored_templates
                .get(&key)
                .cloned()
                .ok_or_else(|| OperateError::InvariantViolation(format!("stored template {key}")))?;
            return Ok((context, template, newly_stored));
        }

        let name = holder.template_name().ok_or_else(|| {
            OperateError::Validation("step names neither a template nor a templateRef".to_string())
        })?;
        let template = self
            .templates
            .iter()
            .find(|template| template.name == name)
            .cloned()
            .or_else(|| stored_templates.get(&self.storage_key(name)).cloned())
            .ok_or_else(|| OperateError::Validation(format!("template {name} not found")))?;
        Ok((self.clone(), template, false))
    }
}

/// Merges spec-level template defaults into a resolved template, field by
/// field. The execution variant of the template is never touched.
pub fn merge_template_defaults(template: &mut Template, defaults: &TemplateDefaults) {
    if template.retry_strategy.is_none() {
        template.retry_strategy = defaults.retry_strategy.clone();
    }
    if template.timeout.is_none() {
        template.timeout = defaults.timeout.clone();
    }
    if template.parallelism.is_none() {
        template.parallelism = defaults.parallelism;
    }
    if template.fail_fast.is_none() {
        template.fail_fast = defaults.fail_fast;
    }
    if template.daemon.is_none() {
        template.daemon = defaults.daemon;
    }
    if template.metrics.is_none() {
        template.metrics = defaults.metrics.clone();
    }
}

/// Merges a workflow on top of its referenced workflow template: the
/// template supplies the base, the workflow overrides what it sets.
pub fn merge_workflow_spec(base: &WorkflowSpec, overlay: &WorkflowSpec) -> WorkflowSpec {
    let mut merged = base.clone();
    if !overlay.entrypoint.is_empty() {
        merged.entrypoint = overlay.entrypoint.clone();
    }
    for parameter in &overlay.arguments.parameters {
        match merged
            .arguments
            .parameters
            .iter_mut()
            .find(|existing| existing.name == parameter.name)
        {
            Some(existing) => *existing = parameter.clone(),
            None => merged.arguments.parameters.push(parameter.clone()),
        }
    }
    for artifact in &overlay.arguments.artifacts {
        match merged
            .arguments
            .artifacts
            .iter_mut()
            .find(|existing| existing.name == artifact.name)
        {
            Some(existing) => *existing = artifact.clone(),
            None => merged.arguments.artifacts.push(artifact.clone()),
        }
    }
    if overlay.on_exit.is_some() {
        merged.on_exit = overlay.on_exit.clone();
    }
    merged.shutdown = overlay.shutdown;
    if overlay.active_deadline_seconds.is_some() {
        merged.active_deadline_seconds = overlay.active_deadline_seconds;
    }
    if overlay.parallelism.is_some() {
        merged.parallelism = overlay.parallelism;
    }
    if overlay.suspend.is_some() {
        merged.suspend = overlay.suspend;
    }
    if overlay.priority.is_some() {
        merged.priority = overlay.priority;
    }
    if overlay.pod_gc.is_some() {
        merged.pod_gc = overlay.pod_gc.clone();
    }
    if overlay.template_defaults.is_some() {
        merged.template_defaults = overlay.template_defaults.clone();
    }
    if overlay.pod_disruption_budget.is_some() {
        merged.pod_disruption_budget = overlay.pod_disruption_budget.clone();
    }
    if overlay.retry_strategy.is_some() {
        merged.retry_strategy = overlay.retry_strategy.clone();
    }
    if overlay.synchronization.is_some() {
        merged.synchronization = overlay.synchronization.clone();
    }
    if overlay.metrics.is_some() {
        merged.metrics = overlay.metrics.clone();
    }
    if overlay.artifact_repository_ref.is_some() {
        merged.artifact_repository_ref = overlay.artifact_repository_ref.clone();
    }
    merged.workflow_template_ref = overlay.workflow_template_ref.clone();
    merged
}

/// Processes arguments into template inputs, then substitutes parameter
/// references through the template's serialized form.
pub fn process_args(
    template: &Template,
    args: &Arguments,
    scope: &Scope,
    local_params: &BTreeMap<String, String>,
) -> Result<Template, OperateError> {
    let mut processed = template.clone();

    let mut inputs: BTreeMap<String, String> = BTreeMap::new();
    for parameter in processed.inputs.parameters.iter_mut() {
        let supplied = args
            .parameters
            .iter()
            .find(|arg| arg.name == parameter.name)
            .and_then(|arg| arg.value.clone());
        let value = supplied
            .or_else(|| parameter.value.clone())
            .or_else(|| {
                parameter
                    .value_from
                    .as_ref()
                    .and_then(|from| from.default.clone())
            })
            .ok_or_else(|| {
                OperateError::Validation(format!(
                    "inputs.parameters.{} was not supplied",
                    parameter.name
                ))
            })?;
        let value = scope.substitute(&value, true)?;
        parameter.value = Some(value.clone());
        inputs.insert(format!("inputs.parameters.{}", parameter.name), value);
    }
    for artifact in processed.inputs.artifacts.iter_mut() {
        if let Some(supplied) = args
            .artifacts
            .iter()
            .find(|arg| arg.name == artifact.name)
        {
            artifact.from = supplied.from.clone().or_else(|| artifact.from.clone());
        }
    }

    let serialized = serde_json::to_string(&processed)?;
    let substituted = substitute_params(&serialized, true, |key| {
        local_params
            .get(key)
            .cloned()
            .or_else(|| inputs.get(key).cloned())
            .or_else(|| scope.lookup(key).map(str::to_string))
    })?;
    if let Some(start) = substituted.find("{{inputs.") {
        let tail: String = substituted[start..].chars().take(60).collect();
        return Err(OperateError::Validation(format!(
            "unresolved input reference: {tail}"
        )));
    }
    Ok(serde_json::from_str(&substituted)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::{ContainerSpec, Parameter, TemplateBody, ValueFrom};

    fn echo_template() -> Template {
        let mut template = Template::new(
            "echo",
            TemplateBody::Container(ContainerSpec {
                image: "alpine".to_string(),
                command: vec!["echo".to_string()],
                args: vec!["{{inputs.parameters.message}}".to_string()],
            }),
        );
        template.inputs.parameters.push(Parameter {
            name: "message".to_string(),
            ..Default::default()
        });
        template
    }

    #[test]
    fn process_args_substitutes_supplied_values() {
        let args = Arguments {
            parameters: vec![Parameter {
                name: "message".to_string(),
                value: Some("hello".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let processed = process_args(&echo_template(), &args, &Scope::default(), &BTreeMap::new())
            .expect("process");
        match &processed.body {
            TemplateBody::Container(container) => {
                assert_eq!(container.args, vec!["hello".to_string()])
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn process_args_falls_back_to_defaults_then_errors() {
        let mut template = echo_template();
        template.inputs.parameters[0].value_from = Some(ValueFrom {
            default: Some("fallback".to_string()),
            ..Default::default()
        });
        let processed = process_args(
            &template,
            &Arguments::default(),
            &Scope::default(),
            &BTreeMap::new(),
        )
        .expect("process");
        assert_eq!(
            processed.inputs.parameters[0].value.as_deref(),
            Some("fallback")
        );

        let missing = process_args(
            &echo_template(),
            &Arguments::default(),
            &Scope::default(),
            &BTreeMap::new(),
        );
        assert!(missing.is_err());
    }

    #[test]
    fn defaults_merge_fills_only_unset_fields() {
        let mut template = echo_template();
        template.timeout = Some("1m".to_string());
        let defaults = TemplateDefaults {
            timeout: Some("5m".to_string()),
            daemon: Some(true),
            ..Default::default()
        };
        merge_template_defaults(&mut template, &defaults);
        assert_eq!(template.timeout.as_deref(), Some("1m"));
        assert_eq!(template.daemon, Some(true));
    }

    #[test]
    fn workflow_spec_merge_overrides_entrypoint_and_parameters() {
        let base = WorkflowSpec {
            entrypoint: "main".to_string(),
            arguments: Arguments {
                parameters: vec![Parameter {
                    name: "tier".to_string(),
                    value: Some("base".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let overlay = WorkflowSpec {
            arguments: Arguments {
                parameters: vec![Parameter {
                    name: "tier".to_string(),
                    value: Some("override".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merge_workflow_spec(&base, &overlay);
        assert_eq!(merged.entrypoint, "main");
        assert_eq!(
            merged.arguments.parameters[0].value.as_deref(),
            Some("override")
        );
    }
}
