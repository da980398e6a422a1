//! Path-scoped authorization: an ordered rule list evaluated
//! first-match-wins over `(path, operation, auth context)`.
//!
//! Rules are declared as `{pattern, operations, expression}` and compiled at
//! load time. Declaration order is significant — overlapping patterns such
//! as `{collection}` and `{collection}/{id}` are resolved by the first rule
//! whose pattern matches the path and whose operation list covers the
//! request. The default policy, and the outcome of every evaluator failure,
//! is deny.

mod expr;
mod pattern;

use serde::{Deserialize, Serialize};

use riptide_protocol::{EngineError, EngineResult, UserId};

pub use expr::{Expr, ExprError, ExprValue, Scope};
pub use pattern::{Bindings, Pattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOperation {
    Read,
    Write,
    Delete,
}

/// One declared rule, as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: String,
    pub operations: Vec<RuleOperation>,
    pub expression: String,
}

impl Rule {
    pub fn new(
        pattern: impl Into<String>,
        operations: Vec<RuleOperation>,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            operations,
            expression: expression.into(),
        }
    }
}

/// The identity attached to a request.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user_id: Option<UserId>,
}

impl AuthContext {
    pub fn user(id: impl Into<UserId>) -> Self {
        Self {
            user_id: Some(id.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

struct EvalScope<'a> {
    auth: &'a AuthContext,
    bindings: &'a Bindings,
}

impl Scope for EvalScope<'_> {
    fn resolve(&self, path: &[String]) -> Option<ExprValue> {
        match path {
            [root, field] if root == "auth" => match field.as_str() {
                "userId" => Some(
                    self.auth
                        .user_id
                        .as_ref()
                        .map(|id| ExprValue::Str(id.as_str().to_owned()))
                        .unwrap_or(ExprValue::Null),
                ),
                _ => None,
            },
            [name] => self
                .bindings
                .get(name)
                .map(|value| ExprValue::Str(value.clone())),
            _ => None,
        }
    }
}

struct CompiledRule {
    pattern: Pattern,
    operations: Vec<RuleOperation>,
    // None when the declared expression failed to parse; such a rule still
    // claims matching requests and denies them.
    expr: Option<Expr>,
}

/// The ordered rule list. `evaluate` answers allow/deny; `authorize` maps
/// deny onto `EngineError::PermissionDenied`.
pub struct RulesEngine {
    rules: Vec<CompiledRule>,
}

impl RulesEngine {
    /// Compile a declared rule list. Invalid patterns are configuration
    /// errors; invalid expressions compile into always-deny rules.
    pub fn new(rules: Vec<Rule>) -> EngineResult<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = Pattern::parse(&rule.pattern)?;
            let expr = match Expr::parse(&rule.expression) {
                Ok(expr) => Some(expr),
                Err(error) => {
                    tracing::warn!(
                        pattern = %rule.pattern,
                        %error,
                        "rule expression failed to parse; rule will deny"
                    );
                    None
                }
            };
            compiled.push(CompiledRule {
                pattern,
                operations: rule.operations,
                expr,
            });
        }
        Ok(Self { rules: compiled })
    }

    /// The shipped default ruleset: any authenticated caller may read and
    /// write top-level collections, documents, and nested paths. Declaration
    /// order: documents before collections before the nested catch-all.
    pub fn permissive_defaults() -> Self {
        let rules = vec![
            Rule::new(
                "{collection}/{id}",
                vec![
                    RuleOperation::Read,
                    RuleOperation::Write,
                    RuleOperation::Delete,
                ],
                "auth.userId != null",
            ),
            Rule::new(
                "{collection}",
                vec![RuleOperation::Read, RuleOperation::Write],
                "auth.userId != null",
            ),
            Rule::new(
                "{collection}/{id}/{rest=**}",
                vec![
                    RuleOperation::Read,
                    RuleOperation::Write,
                    RuleOperation::Delete,
                ],
                "auth.userId != null",
            ),
        ];
        Self::new(rules).unwrap_or_else(|_| unreachable!("default rules are well-formed"))
    }

    pub fn evaluate(&self, path: &[String], operation: RuleOperation, auth: &AuthContext) -> bool {
        for rule in &self.rules {
            if !rule.operations.contains(&operation) {
                continue;
            }
            let Some(bindings) = rule.pattern.matches(path) else {
                continue;
            };
            let Some(expr) = &rule.expr else {
                return false;
            };
            let scope = EvalScope {
                auth,
                bindings: &bindings,
            };
            return match expr.eval(&scope) {
                Ok(ExprValue::Bool(true)) => true,
                Ok(_) => false,
                Err(error) => {
                    tracing::debug!(%error, "rule evaluation failed; denying");
                    false
                }
            };
        }
        false
    }

    pub fn authorize(
        &self,
        path: &[String],
        operation: RuleOperation,
        auth: &AuthContext,
    ) -> EngineResult<()> {
        if self.evaluate(path, operation, auth) {
            Ok(())
        } else {
            Err(EngineError::denied(format!(
                "{operation:?} on {:?}",
                path.join("/")
            )))
        }
    }
}
