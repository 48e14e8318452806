//! Execution rule descriptors.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use super::{EngineError, ExecutionOptions};
use crate::ai::AiService;
use crate::types::{ActionContext, ActionInput, InputKind, ProcessedResult, SourceContext};

/// Fine-grained applicability check, evaluated after source and input kind match
pub type ConditionFn = Arc<dyn Fn(&ActionInput, &ActionContext) -> bool + Send + Sync>;

/// Everything a processor may look at while handling one request
pub struct RuleRequest<'a> {
    pub input: &'a ActionInput,
    pub context: &'a ActionContext,
    pub options: &'a ExecutionOptions,
    pub ai: &'a dyn AiService,
}

/// The work a rule performs
#[async_trait]
pub trait RuleProcessor: Send + Sync {
    async fn process(&self, request: RuleRequest<'_>) -> Result<ProcessedResult, EngineError>;
}

/// A registered `(source, input kinds, condition, priority) -> processor` mapping
#[derive(Clone)]
pub struct ExecutionRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub source: SourceContext,
    pub input_types: Vec<InputKind>,
    pub action: String,
    pub condition: Option<ConditionFn>,
    pub processor: Arc<dyn RuleProcessor>,
    pub auto_copy: bool,
    /// Higher runs first
    pub priority: i32,
}

impl ExecutionRule {
    pub fn new(
        id: impl Into<String>,
        source: SourceContext,
        input_types: Vec<InputKind>,
        action: impl Into<String>,
        processor: Arc<dyn RuleProcessor>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            description: String::new(),
            id,
            source,
            input_types,
            action: action.into(),
            condition: None,
            processor,
            auto_copy: false,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&ActionInput, &ActionContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_auto_copy(mut self, auto_copy: bool) -> Self {
        self.auto_copy = auto_copy;
        self
    }

    pub fn with_description(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.name = name.into();
        self.description = description.into();
        self
    }

    /// Source and input kind match
    pub fn accepts(&self, source: SourceContext, kind: InputKind) -> bool {
        self.source == source && self.input_types.contains(&kind)
    }

    pub fn condition_holds(&self, input: &ActionInput, context: &ActionContext) -> bool {
        self.condition.as_ref().map_or(true, |c| c(input, context))
    }

    /// Source, input kind and condition all match
    pub fn matches(&self, input: &ActionInput, context: &ActionContext) -> bool {
        self.accepts(context.source, input.kind) && self.condition_holds(input, context)
    }
}

impl fmt::Debug for ExecutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRule")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("input_types", &self.input_types)
            .field("action", &self.action)
            .field("priority", &self.priority)
            .field("auto_copy", &self.auto_copy)
            .finish()
    }
}
