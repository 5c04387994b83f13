//! Layered parameter scope and `{{...}}` substitution.
//!
//! Three layers: global (workflow-wide), local (one per executing Steps/DAG
//! frame), and real-time (thunks returning f64, consumed only by metric
//! evaluation). Keys follow the dotted namespace: `workflow.parameters.X`,
//! `steps.NAME.outputs.result`, `tasks.NAME.outputs.parameters.X`,
//! `pod.name`, `retries`.

use std::collections::BTreeMap;
use std::sync::Arc;

use foreman_model::Artifact;

use crate::error::OperateError;

pub type RealtimeThunk = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Clone, Default)]
pub struct Scope {
    global_params: BTreeMap<String, String>,
    local_params: BTreeMap<String, String>,
    artifacts: BTreeMap<String, Artifact>,
    realtime: BTreeMap<String, RealtimeThunk>,
}

impl Scope {
    pub fn new(global_params: BTreeMap<String, String>) -> Self {
        Self {
            global_params,
            ..Default::default()
        }
    }

    pub fn set_global(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.global_params.insert(key.into(), value.into());
    }

    pub fn set_local(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.local_params.insert(key.into(), value.into());
    }

    pub fn set_artifact(&mut self, key: impl Into<String>, artifact: Artifact) {
        self.artifacts.insert(key.into(), artifact);
    }

    pub fn set_realtime(&mut self, key: impl Into<String>, thunk: RealtimeThunk) {
        self.realtime.insert(key.into(), thunk);
    }

    /// Local frame shadows the workflow-wide layer.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.local_params
            .get(key)
            .or_else(|| self.global_params.get(key))
            .map(String::as_str)
    }

    pub fn lookup_artifact(&self, key: &str) -> Option<&Artifact> {
        self.artifacts.get(key)
    }

    pub fn lookup_realtime(&self, key: &str) -> Option<&RealtimeThunk> {
        self.realtime.get(key)
    }

    pub fn global_params(&self) -> &BTreeMap<String, String> {
        &self.global_params
    }

    /// Substitutes every `{{key}}` reference in `text`.
    ///
    /// Unresolved references are an error unless `allow_unresolved`, in which
    /// case they pass through untouched (later frames may resolve them).
    pub fn substitute(&self, text: &str, allow_unresolved: bool) -> Result<String, OperateError> {
        substitute_params(text, allow_unresolved, |key| {
            self.lookup(key).map(str::to_string)
        })
    }
}

/// Text substitution of `{{...}}` references through a lookup function.
pub fn substitute_params(
    text: &str,
    allow_unresolved: bool,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, OperateError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            // unbalanced braces pass through verbatim
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let raw_key = &after_open[..close];
        let key = raw_key.trim();
        match lookup(key) {
            Some(value) => out.push_str(&value),
            None if allow_unresolved => {
                out.push_str("{{");
                out.push_str(raw_key);
                out.push_str("}}");
            }
            None => {
                return Err(OperateError::Validation(format!(
                    "failed to resolve {{{{{key}}}}}"
                )))
            }
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        let mut scope = Scope::new(BTreeMap::from([(
            "workflow.name".to_string(),
            "wf".to_string(),
        )]));
        scope.set_local("inputs.parameters.message", "hello");
        scope
    }

    #[test]
    fn substitute_resolves_both_layers() {
        let out = scope()
            .substitute("{{workflow.name}}: {{inputs.parameters.message}}", false)
            .expect("substitute");
        assert_eq!(out, "wf: hello");
    }

    #[test]
    fn local_layer_shadows_global() {
        let mut scope = scope();
        scope.set_global("inputs.parameters.message", "global");
        assert_eq!(scope.lookup("inputs.parameters.message"), Some("hello"));
    }

    #[test]
    fn unresolved_reference_errors_unless_allowed() {
        let scope = scope();
        assert!(scope.substitute("{{missing}}", false).is_err());
        let out = scope.substitute("{{missing}}", true).expect("pass through");
        assert_eq!(out, "{{missing}}");
    }

    #[test]
    fn unbalanced_braces_pass_through() {
        let out = scope().substitute("{{workflow.name", false).expect("substitute");
        assert_eq!(out, "{{workflow.name");
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let out = scope()
            .substitute("{{ workflow.name }}", false)
            .expect("substitute");
        assert_eq!(out, "wf");
    }
}
