//! Declarative route rule table and its deterministic matcher.
//!
//! Every inbound request is classified exactly once against one ordered
//! table. Among all rules matching a request, the most specific wins:
//! exact patterns beat prefixes, longer patterns beat shorter ones, an
//! explicit method list beats "any method". Rules equal on all three keep
//! declaration order, so the first one declared wins.

use crate::GateError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How much protection a route requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    /// No credential needed.
    Public,
    /// Valid credential needed.
    Protected,
    /// Valid credential and an active subscription needed.
    Gated,
}

/// Path pattern of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// Matches one normalized path.
    Exact(String),
    /// Matches the base path and everything beneath it (`/base/**`).
    Prefix(String),
}

impl PathPattern {
    /// Parse `"/a/b"` (exact) or `"/a/b/**"` (prefix).
    pub fn parse(pattern: &str) -> Result<Self, GateError> {
        let pattern = pattern.trim();
        if !pattern.starts_with('/') {
            return Err(GateError::RouteTable(format!(
                "pattern must start with '/': {}",
                pattern
            )));
        }
        if let Some(base) = pattern.strip_suffix("/**") {
            return Ok(PathPattern::Prefix(normalize_path(base)));
        }
        if pattern.contains('*') {
            return Err(GateError::RouteTable(format!(
                "wildcard only allowed as trailing /**: {}",
                pattern
            )));
        }
        Ok(PathPattern::Exact(normalize_path(pattern)))
    }

    /// Whether a normalized path matches.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => path == exact,
            PathPattern::Prefix(base) if base == "/" => true,
            PathPattern::Prefix(base) => {
                path == base
                    || path
                        .strip_prefix(base.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }

    fn text(&self) -> &str {
        match self {
            PathPattern::Exact(p) | PathPattern::Prefix(p) => p,
        }
    }
}

/// One row of the route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// Path pattern.
    pub pattern: PathPattern,
    /// Upper-case method names; empty means any method.
    pub methods: Vec<String>,
    /// Required protection.
    pub class: RouteClass,
    /// Admit requests with a missing or invalid credential as anonymous.
    /// Ignored on gated routes.
    pub allow_anonymous: bool,
}

impl RouteRule {
    /// Rule for any method.
    pub fn new(pattern: &str, class: RouteClass) -> Result<Self, GateError> {
        Ok(rule(PathPattern::parse(pattern)?, class))
    }

    /// Restrict the rule to the given methods.
    pub fn methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        self
    }

    /// Let anonymous requests fall through.
    pub fn anonymous(mut self) -> Self {
        self.allow_anonymous = true;
        self
    }

    fn matches_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    fn specificity(&self) -> (bool, usize, bool) {
        (
            matches!(self.pattern, PathPattern::Exact(_)),
            self.pattern.text().len(),
            !self.methods.is_empty(),
        )
    }

    fn methods_overlap(&self, other: &RouteRule) -> bool {
        self.methods.is_empty()
            || other.methods.is_empty()
            || self.methods.iter().any(|m| other.methods.contains(m))
    }
}

/// Result of matching a request against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch {
    /// Required protection.
    pub class: RouteClass,
    /// Index of the winning rule, `None` for the default class or pre-flight.
    pub rule: Option<usize>,
    /// Whether anonymous fallthrough is allowed.
    pub allow_anonymous: bool,
}

/// Two rules with the same pattern and overlapping methods but different
/// classes. The later one can never win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleConflict {
    /// Index of the rule that wins.
    pub winner: usize,
    /// Index of the shadowed rule.
    pub shadowed: usize,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    pattern: String,
    #[serde(default)]
    methods: Vec<String>,
    class: RouteClass,
    #[serde(default)]
    allow_anonymous: bool,
}

#[derive(Debug, Deserialize)]
struct TableSpec {
    #[serde(default = "default_class")]
    default_class: RouteClass,
    rules: Vec<RuleSpec>,
}

fn default_class() -> RouteClass {
    RouteClass::Protected
}

fn rule(pattern: PathPattern, class: RouteClass) -> RouteRule {
    RouteRule {
        pattern,
        methods: Vec::new(),
        class,
        allow_anonymous: false,
    }
}

/// Ordered, immutable route rule table.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    default_class: RouteClass,
}

impl RouteTable {
    /// Build a table. Conflicting rules are logged, not rejected.
    pub fn new(rules: Vec<RouteRule>, default_class: RouteClass) -> Self {
        let table = Self {
            rules,
            default_class,
        };
        for conflict in table.conflicts() {
            warn!(
                winner = table.rules[conflict.winner].pattern.text(),
                shadowed_index = conflict.shadowed,
                "route rule is shadowed by an earlier rule with a different class"
            );
        }
        table
    }

    /// Load a table from JSON:
    /// `{"default_class":"protected","rules":[{"pattern":"/api/x/**","methods":["GET"],"class":"gated"}]}`
    pub fn from_json(json: &str) -> Result<Self, GateError> {
        let spec: TableSpec = serde_json::from_str(json)
            .map_err(|e| GateError::RouteTable(format!("Parse error: {}", e)))?;
        let rules = spec
            .rules
            .into_iter()
            .map(|r| {
                Ok(RouteRule {
                    pattern: PathPattern::parse(&r.pattern)?,
                    methods: r.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
                    class: r.class,
                    allow_anonymous: r.allow_anonymous,
                })
            })
            .collect::<Result<Vec<_>, GateError>>()?;
        Ok(Self::new(rules, spec.default_class))
    }

    /// The analytics service's route table.
    pub fn default_rules() -> Self {
        use RouteClass::*;
        let exact = |path: &str, class| rule(PathPattern::Exact(path.to_string()), class);
        let prefix = |path: &str, class| rule(PathPattern::Prefix(path.to_string()), class);
        Self::new(
            vec![
                prefix("/api/public", Public),
                prefix("/api/auth", Public),
                exact("/api/subscription/plans", Public).methods(&["GET"]),
                exact("/api/subscription/create-trial", Public).methods(&["POST"]),
                prefix("/api/subscription/create-trial", Public).methods(&["POST"]),
                exact("/api/subscription/info", Protected)
                    .methods(&["GET"])
                    .anonymous(),
                prefix("/api/subscription", Protected),
                prefix("/api/analytics", Gated),
            ],
            Protected,
        )
    }

    /// Rules in declaration order.
    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Class applied when nothing matches.
    pub fn default_class(&self) -> RouteClass {
        self.default_class
    }

    /// Classify a request.
    pub fn classify(&self, method: &str, path: &str) -> RouteClass {
        self.resolve(method, path).class
    }

    /// Match a request and report the winning rule.
    pub fn resolve(&self, method: &str, path: &str) -> RouteMatch {
        if method.eq_ignore_ascii_case("OPTIONS") {
            return RouteMatch {
                class: RouteClass::Public,
                rule: None,
                allow_anonymous: true,
            };
        }

        let path = normalize_path(path);
        let mut best: Option<(usize, &RouteRule)> = None;
        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.pattern.matches(&path) || !rule.matches_method(method) {
                continue;
            }
            // Strictly greater only: ties keep the earlier rule.
            if best.map_or(true, |(_, b)| rule.specificity() > b.specificity()) {
                best = Some((index, rule));
            }
        }

        match best {
            Some((index, rule)) => RouteMatch {
                class: rule.class,
                rule: Some(index),
                allow_anonymous: rule.allow_anonymous,
            },
            None => RouteMatch {
                class: self.default_class,
                rule: None,
                allow_anonymous: false,
            },
        }
    }

    /// Rules made unreachable by an earlier rule of equal specificity.
    pub fn conflicts(&self) -> Vec<RuleConflict> {
        let mut conflicts = Vec::new();
        for (i, first) in self.rules.iter().enumerate() {
            for (j, second) in self.rules.iter().enumerate().skip(i + 1) {
                if first.pattern == second.pattern
                    && first.specificity() == second.specificity()
                    && first.methods_overlap(second)
                    && first.class != second.class
                {
                    conflicts.push(RuleConflict {
                        winner: i,
                        shadowed: j,
                    });
                }
            }
        }
        conflicts
    }
}

/// Reduce a request target to its canonical path.
///
/// Drops query and fragment, collapses repeated slashes, removes a trailing
/// slash and guarantees a leading one.
pub fn normalize_path(raw: &str) -> String {
    let path = raw
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or_default()
        .trim();

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}
