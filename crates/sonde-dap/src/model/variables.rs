//! Lazily resolved variable trees.
//!
//! Every adapter container (a scope, a structured variable, an evaluated
//! expression) is an [`ExpressionContainer`]. Its children are fetched on the
//! first [`ExpressionContainer::children`] call and cached for the
//! container's lifetime. Large indexed collections are split into virtual
//! [`VariableRange`] nodes instead of being fetched in one request.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use tokio::sync::OnceCell;

use crate::error::DapError;
use crate::lock;
use crate::model::SessionContext;
use crate::protocol::{
    self, EvaluateResponseBody, SetVariableArguments, SetVariableResponseBody, VariablesArguments,
    VariablesFilter, VariablesResponseBody,
};
use crate::session::DebugSession;

/// Paging base: indexed children are split so no container lists more
/// than this many ranges, and ranges grow by this factor.
pub const BASE_CHUNK_SIZE: i64 = 100;

/// Value shown for an expression that has not been evaluated.
pub const NOT_AVAILABLE: &str = "not available";

/// Value shown for an expression evaluated without a session.
pub const NO_SESSION: &str = "Please start a debug session to evaluate";

/// A child of an [`ExpressionContainer`].
#[derive(Debug, Clone)]
pub enum VariableNode {
    Variable(Arc<DebugVariable>),
    Range(Arc<VariableRange>),
    /// The fetch failed; carries the adapter's message.
    Error(String),
}

impl VariableNode {
    /// Label of the node as shown in a tree.
    pub fn name(&self) -> String {
        match self {
            VariableNode::Variable(v) => v.name().to_string(),
            VariableNode::Range(r) => r.name.clone(),
            VariableNode::Error(message) => message.clone(),
        }
    }
}

/// Children of one adapter `variablesReference`.
pub struct ExpressionContainer {
    ctx: Arc<SessionContext>,
    variables_reference: i64,
    named_variables: i64,
    indexed_variables: i64,
    start_of_variables: i64,
    children: OnceCell<Vec<VariableNode>>,
}

impl ExpressionContainer {
    /// A container for `variables_reference`. A reference of 0 has no
    /// children.
    pub fn new(
        ctx: Arc<SessionContext>,
        variables_reference: i64,
        named_variables: Option<i64>,
        indexed_variables: Option<i64>,
    ) -> Self {
        Self::with_offset(
            ctx,
            variables_reference,
            named_variables.unwrap_or(0),
            indexed_variables.unwrap_or(0),
            0,
        )
    }

    fn with_offset(
        ctx: Arc<SessionContext>,
        variables_reference: i64,
        named_variables: i64,
        indexed_variables: i64,
        start_of_variables: i64,
    ) -> Self {
        Self {
            ctx,
            variables_reference,
            named_variables,
            indexed_variables,
            start_of_variables,
            children: OnceCell::new(),
        }
    }

    pub fn variables_reference(&self) -> i64 {
        self.variables_reference
    }

    pub fn has_children(&self) -> bool {
        self.variables_reference > 0
    }

    /// Whether the children have been fetched.
    pub fn is_resolved(&self) -> bool {
        self.children.initialized()
    }

    /// The children, fetched once. Concurrent callers share the same fetch.
    pub async fn children(&self) -> Vec<VariableNode> {
        self.children
            .get_or_init(|| self.resolve())
            .await
            .clone()
    }

    async fn resolve(&self) -> Vec<VariableNode> {
        let mut nodes = Vec::new();
        if !self.has_children() {
            return nodes;
        }
        if self.named_variables > 0 {
            self.fetch(&mut nodes, Some(VariablesFilter::Named), None, None)
                .await;
        }
        if self.indexed_variables > 0 {
            let mut chunk_size = BASE_CHUNK_SIZE;
            while self.indexed_variables > chunk_size * BASE_CHUNK_SIZE {
                chunk_size *= BASE_CHUNK_SIZE;
            }
            if self.indexed_variables > chunk_size {
                let chunks = (self.indexed_variables + chunk_size - 1) / chunk_size;
                for i in 0..chunks {
                    let start = self.start_of_variables + i * chunk_size;
                    let count = chunk_size.min(self.indexed_variables - i * chunk_size);
                    nodes.push(VariableNode::Range(Arc::new(VariableRange {
                        name: format!("[{}..{}]", start, start + count - 1),
                        start,
                        count,
                        container: ExpressionContainer::with_offset(
                            Arc::clone(&self.ctx),
                            self.variables_reference,
                            0,
                            count,
                            start,
                        ),
                    })));
                }
            } else {
                self.fetch(
                    &mut nodes,
                    Some(VariablesFilter::Indexed),
                    Some(self.start_of_variables),
                    Some(self.indexed_variables),
                )
                .await;
            }
        }
        if self.named_variables == 0 && self.indexed_variables == 0 {
            self.fetch(&mut nodes, None, None, None).await;
        }
        nodes
    }

    async fn fetch(
        &self,
        nodes: &mut Vec<VariableNode>,
        filter: Option<VariablesFilter>,
        start: Option<i64>,
        count: Option<i64>,
    ) {
        let arguments = VariablesArguments {
            variables_reference: self.variables_reference,
            filter,
            start,
            count,
        };
        let result: Result<VariablesResponseBody, DapError> =
            self.ctx.connection.request("variables", arguments).await;
        match result {
            Ok(body) => {
                let mut seen = HashSet::new();
                for raw in body.variables {
                    if !seen.insert(raw.name.clone()) {
                        continue;
                    }
                    nodes.push(VariableNode::Variable(Arc::new(DebugVariable::new(
                        Arc::clone(&self.ctx),
                        self.variables_reference,
                        raw,
                    ))));
                }
            }
            Err(e) => {
                tracing::debug!(
                    session = %self.ctx.session_id,
                    reference = self.variables_reference,
                    "variables request failed: {e}"
                );
                nodes.push(VariableNode::Error(e.user_message()));
            }
        }
    }
}

impl std::fmt::Debug for ExpressionContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionContainer")
            .field("variables_reference", &self.variables_reference)
            .field("named_variables", &self.named_variables)
            .field("indexed_variables", &self.indexed_variables)
            .field("start_of_variables", &self.start_of_variables)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// A virtual page `[start..start + count - 1]` of a large indexed container.
#[derive(Debug)]
pub struct VariableRange {
    pub name: String,
    pub start: i64,
    pub count: i64,
    pub container: ExpressionContainer,
}

/// How a value is styled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number,
    Boolean,
    String,
    Other,
}

struct ValuePatterns {
    number: Regex,
    boolean: Regex,
    string: Regex,
}

fn value_patterns() -> Option<&'static ValuePatterns> {
    static PATTERNS: OnceLock<Option<ValuePatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(ValuePatterns {
                number: Regex::new(
                    r"^(?:[+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?|0[xX][0-9a-fA-F]+|[+-]?Infinity)$",
                )
                .ok()?,
                boolean: Regex::new(r"(?i)^(?:true|false)$").ok()?,
                string: Regex::new(r#"(?s)^(?:".*"|'.*')$"#).ok()?,
            })
        })
        .as_ref()
}

impl ValueKind {
    /// Classify by the adapter's type name, else by the value's shape.
    pub fn classify(value: &str, type_name: Option<&str>) -> Self {
        match type_name {
            Some("number") => return ValueKind::Number,
            Some("boolean") => return ValueKind::Boolean,
            Some("string") => return ValueKind::String,
            _ => {}
        }
        let Some(patterns) = value_patterns() else {
            return ValueKind::Other;
        };
        let value = value.trim();
        if patterns.number.is_match(value) {
            ValueKind::Number
        } else if patterns.boolean.is_match(value) {
            ValueKind::Boolean
        } else if patterns.string.is_match(value) {
            ValueKind::String
        } else {
            ValueKind::Other
        }
    }
}

/// A variable reported by the adapter.
pub struct DebugVariable {
    ctx: Arc<SessionContext>,
    parent_reference: i64,
    name: String,
    raw: Mutex<protocol::Variable>,
    container: Mutex<Arc<ExpressionContainer>>,
}

impl DebugVariable {
    fn new(ctx: Arc<SessionContext>, parent_reference: i64, raw: protocol::Variable) -> Self {
        let container = Arc::new(ExpressionContainer::new(
            Arc::clone(&ctx),
            raw.variables_reference,
            raw.named_variables,
            raw.indexed_variables,
        ));
        Self {
            ctx,
            parent_reference,
            name: raw.name.clone(),
            raw: Mutex::new(raw),
            container: Mutex::new(container),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> String {
        lock(&self.raw).value.clone()
    }

    pub fn variable_type(&self) -> Option<String> {
        lock(&self.raw).variable_type.clone()
    }

    pub fn evaluate_name(&self) -> Option<String> {
        lock(&self.raw).evaluate_name.clone()
    }

    pub fn raw(&self) -> protocol::Variable {
        lock(&self.raw).clone()
    }

    pub fn value_kind(&self) -> ValueKind {
        let raw = lock(&self.raw);
        ValueKind::classify(&raw.value, raw.variable_type.as_deref())
    }

    pub fn has_children(&self) -> bool {
        lock(&self.container).has_children()
    }

    /// Children of a structured value.
    pub async fn children(&self) -> Vec<VariableNode> {
        let container = lock(&self.container).clone();
        container.children().await
    }

    /// Assign a new value through `setVariable`.
    ///
    /// The variable's children are dropped and refetched on next access.
    pub async fn set_value(&self, value: &str) -> Result<(), DapError> {
        let body: SetVariableResponseBody = self
            .ctx
            .connection
            .request(
                "setVariable",
                SetVariableArguments {
                    variables_reference: self.parent_reference,
                    name: self.name.clone(),
                    value: value.to_string(),
                },
            )
            .await?;
        let container = {
            let mut raw = lock(&self.raw);
            raw.value = body.value;
            if body.variable_type.is_some() {
                raw.variable_type = body.variable_type;
            }
            raw.variables_reference = body.variables_reference.unwrap_or(0);
            raw.named_variables = body.named_variables;
            raw.indexed_variables = body.indexed_variables;
            ExpressionContainer::new(
                Arc::clone(&self.ctx),
                raw.variables_reference,
                raw.named_variables,
                raw.indexed_variables,
            )
        };
        *lock(&self.container) = Arc::new(container);
        Ok(())
    }
}

impl std::fmt::Debug for DebugVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugVariable")
            .field("parent_reference", &self.parent_reference)
            .field("raw", &*lock(&self.raw))
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Evaluation {
    value: String,
    result_type: Option<String>,
    available: bool,
    container: Option<Arc<ExpressionContainer>>,
}

/// A watch or console expression.
#[derive(Debug)]
pub struct ExpressionItem {
    expression: String,
    state: Mutex<Evaluation>,
}

impl ExpressionItem {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            state: Mutex::new(Evaluation {
                value: NOT_AVAILABLE.to_string(),
                result_type: None,
                available: false,
                container: None,
            }),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn value(&self) -> String {
        lock(&self.state).value.clone()
    }

    pub fn result_type(&self) -> Option<String> {
        lock(&self.state).result_type.clone()
    }

    /// Whether the last evaluation succeeded.
    pub fn is_available(&self) -> bool {
        lock(&self.state).available
    }

    pub fn value_kind(&self) -> ValueKind {
        let state = lock(&self.state);
        ValueKind::classify(&state.value, state.result_type.as_deref())
    }

    /// Evaluate in `session`'s current frame.
    ///
    /// Never fails: without a session, or when the adapter rejects the
    /// expression, the value becomes an explanatory message instead.
    pub async fn evaluate(&self, session: Option<&DebugSession>, context: &str) {
        let Some(session) = session else {
            self.set(NO_SESSION.to_string(), None, false, None);
            return;
        };
        match session.evaluate(&self.expression, context).await {
            Ok(body) => {
                let EvaluateResponseBody {
                    result,
                    result_type,
                    variables_reference,
                    named_variables,
                    indexed_variables,
                } = body;
                let container = Arc::new(ExpressionContainer::new(
                    session.context(),
                    variables_reference,
                    named_variables,
                    indexed_variables,
                ));
                self.set(result, result_type, true, Some(container));
            }
            Err(e) => self.set(e.user_message(), None, false, None),
        }
    }

    fn set(
        &self,
        value: String,
        result_type: Option<String>,
        available: bool,
        container: Option<Arc<ExpressionContainer>>,
    ) {
        *lock(&self.state) = Evaluation {
            value,
            result_type,
            available,
            container,
        };
    }

    /// Children of a structured result; empty before a successful evaluation.
    pub async fn children(&self) -> Vec<VariableNode> {
        let container = lock(&self.state).container.clone();
        match container {
            Some(container) => container.children().await,
            None => Vec::new(),
        }
    }
}
