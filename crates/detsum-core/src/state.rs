//! Named states derived from boolean expressions over data-quality flags.
//!
//! A state is a named interval set over which a subset of channels and
//! plots apply. Its definition is a boolean expression with flag names as
//! leaves: `&` intersects, `|` unions, `!` takes the complement within the
//! enclosing query span (a free-standing complement needs a bound, so NOT
//! only exists relative to the span being resolved). `&` binds tighter
//! than `|`, parentheses override, equal precedence associates left.
//!
//! Expressions are parsed once at configuration-load time into a typed
//! tree; evaluation never re-parses.
//!
//! Resolution is two-phase and never guesses: if any leaf flag has
//! unknown time within the requested span, the resolver reports those
//! gaps upward so the caller can fetch exactly them and re-resolve.

use crate::error::ConfigError;
use crate::flag::FlagStore;
use crate::interval::{Interval, IntervalSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Name of the built-in all-time state.
pub const ALL_STATE: &str = "All";

// =============================================================================
// Expression tree
// =============================================================================

/// A parsed boolean expression over flag names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateExpr {
    /// The sentinel all-time state: the whole query span, no flags needed.
    All,
    /// A single flag's active time.
    Flag(String),
    /// Complement within the query span.
    Not(Box<StateExpr>),
    /// Intersection.
    And(Box<StateExpr>, Box<StateExpr>),
    /// Union.
    Or(Box<StateExpr>, Box<StateExpr>),
}

impl StateExpr {
    /// Parse an expression string.
    ///
    /// The literal `ALL` (any case) is the all-time sentinel. Flag names
    /// may contain alphanumerics and `: _ - . ,` (detector flag names look
    /// like `L1:DMT-ANALYSIS_READY:1`).
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        Parser::new(input).parse()
    }

    /// Collect the distinct flag names this expression depends on.
    #[must_use]
    pub fn flags(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_flags(&mut out);
        out
    }

    fn collect_flags(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::All => {}
            Self::Flag(name) => {
                out.insert(name.clone());
            }
            Self::Not(inner) => inner.collect_flags(out),
            Self::And(lhs, rhs) | Self::Or(lhs, rhs) => {
                lhs.collect_flags(out);
                rhs.collect_flags(out);
            }
        }
    }

    /// Evaluate over fully-known flag data, bounded to `span`.
    ///
    /// Callers must have established that every leaf is known over `span`
    /// (or accept that unknown time evaluates as inactive; see
    /// [`StateResolver::resolve`] for the exactness protocol).
    #[must_use]
    pub fn evaluate(&self, store: &FlagStore, span: Interval) -> IntervalSet {
        match self {
            Self::All => IntervalSet::from_span(span),
            Self::Flag(name) => store.query(name, span).active,
            Self::Not(inner) => inner.evaluate(store, span).complement_within(span),
            Self::And(lhs, rhs) => lhs
                .evaluate(store, span)
                .intersection(&rhs.evaluate(store, span)),
            Self::Or(lhs, rhs) => lhs.evaluate(store, span).union(&rhs.evaluate(store, span)),
        }
    }
}

impl fmt::Display for StateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::Flag(name) => write!(f, "{name}"),
            Self::Not(inner) => write!(f, "!({inner})"),
            Self::And(lhs, rhs) => write!(f, "({lhs} & {rhs})"),
            Self::Or(lhs, rhs) => write!(f, "({lhs} | {rhs})"),
        }
    }
}

// =============================================================================
// Parser
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    input: String,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.' | ',')
}

impl Parser {
    fn new(input: &str) -> Self {
        let mut tokens = Vec::new();
        let mut chars = input.chars().peekable();
        while let Some(&c) = chars.peek() {
            match c {
                ' ' | '\t' => {
                    chars.next();
                }
                '&' => {
                    chars.next();
                    tokens.push(Token::And);
                }
                '|' => {
                    chars.next();
                    tokens.push(Token::Or);
                }
                '!' => {
                    chars.next();
                    tokens.push(Token::Not);
                }
                '(' => {
                    chars.next();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    chars.next();
                    tokens.push(Token::RParen);
                }
                c if is_ident_char(c) => {
                    let mut ident = String::new();
                    while let Some(&c) = chars.peek() {
                        if is_ident_char(c) {
                            ident.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push(Token::Ident(ident));
                }
                other => {
                    // Record the offender as a pseudo-ident; parse() rejects it.
                    tokens.push(Token::Ident(format!("\u{fffd}{other}")));
                    chars.next();
                }
            }
        }
        Self {
            tokens,
            pos: 0,
            input: input.to_string(),
        }
    }

    fn error(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::Expression {
            name: self.input.clone(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse(mut self) -> Result<StateExpr, ConfigError> {
        if self.tokens.is_empty() {
            return Err(self.error("empty expression"));
        }
        let expr = self.parse_or()?;
        if self.pos != self.tokens.len() {
            return Err(self.error("trailing tokens after expression"));
        }
        Ok(expr)
    }

    /// `or := and ( '|' and )*`
    fn parse_or(&mut self) -> Result<StateExpr, ConfigError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = StateExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    /// `and := factor ( '&' factor )*`; binds tighter than `|`.
    fn parse_and(&mut self) -> Result<StateExpr, ConfigError> {
        let mut lhs = self.parse_factor()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_factor()?;
            lhs = StateExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    /// `factor := '!' factor | '(' or ')' | ident`
    fn parse_factor(&mut self) -> Result<StateExpr, ConfigError> {
        match self.next() {
            Some(Token::Not) => Ok(StateExpr::Not(Box::new(self.parse_factor()?))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("unbalanced parenthesis")),
                }
            }
            Some(Token::Ident(name)) => {
                if name.starts_with('\u{fffd}') {
                    return Err(self.error(format!(
                        "unexpected character '{}'",
                        name.trim_start_matches('\u{fffd}')
                    )));
                }
                if name.eq_ignore_ascii_case("all") {
                    Ok(StateExpr::All)
                } else {
                    Ok(StateExpr::Flag(name))
                }
            }
            _ => Err(self.error("expected flag name, '!', or '('")),
        }
    }
}

// =============================================================================
// Definitions and resolution
// =============================================================================

/// A named state definition: a name plus its parsed expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    pub expr: StateExpr,
}

impl StateDefinition {
    /// Parse a definition from its configured expression string.
    pub fn parse(name: impl Into<String>, expression: &str) -> Result<Self, ConfigError> {
        let name = name.into();
        let expr = StateExpr::parse(expression).map_err(|err| match err {
            ConfigError::Expression { reason, .. } => ConfigError::Expression {
                name: name.clone(),
                reason,
            },
            other => other,
        })?;
        Ok(Self { name, expr })
    }

    /// The built-in all-time state.
    #[must_use]
    pub fn all_time() -> Self {
        Self {
            name: ALL_STATE.to_string(),
            expr: StateExpr::All,
        }
    }
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Every leaf was fully known over the span; the set is exact.
    Resolved(IntervalSet),
    /// One or more leaves have unknown time; the union of those gaps.
    /// Fetch exactly these, merge, and re-resolve.
    MissingFlagData(IntervalSet),
}

/// Resolves state definitions against a [`FlagStore`], caching exact
/// results keyed by (state name, query span).
#[derive(Debug, Default)]
pub struct StateResolver {
    definitions: HashMap<String, StateDefinition>,
    // f64 spans keyed by bit pattern; spans come from config or archive
    // metadata, so bitwise identity is the right notion of "same span".
    cache: HashMap<(String, u64, u64), IntervalSet>,
}

impl StateResolver {
    /// Create a resolver pre-loaded with the built-in all-time state.
    #[must_use]
    pub fn new() -> Self {
        let mut resolver = Self::default();
        resolver.register(StateDefinition::all_time());
        resolver
    }

    /// Register a state definition, replacing any previous definition of
    /// the same name (and dropping its cached resolutions).
    pub fn register(&mut self, def: StateDefinition) {
        self.invalidate_state(&def.name);
        self.definitions.insert(def.name.clone(), def);
    }

    /// Look up a registered definition.
    #[must_use]
    pub fn definition(&self, name: &str) -> Option<&StateDefinition> {
        self.definitions.get(name)
    }

    /// Iterate over all registered definitions.
    pub fn definitions(&self) -> impl Iterator<Item = &StateDefinition> {
        self.definitions.values()
    }

    /// Resolve a named state over `span`.
    ///
    /// Exact-or-gaps: returns [`Resolution::MissingFlagData`] whenever any
    /// leaf has unknown time in the span, rather than guessing. Exact
    /// results are cached; a repeated call with the same span is a lookup.
    pub fn resolve(
        &mut self,
        name: &str,
        span: Interval,
        store: &FlagStore,
    ) -> Result<Resolution, ConfigError> {
        let def = self
            .definitions
            .get(name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown state '{name}'")))?;

        let key = (name.to_string(), span.start.to_bits(), span.end.to_bits());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Resolution::Resolved(cached.clone()));
        }

        let gaps = leaf_gaps(&def.expr, span, store);
        if !gaps.is_empty() {
            return Ok(Resolution::MissingFlagData(gaps));
        }

        let resolved = def.expr.evaluate(store, span);
        self.cache.insert(key, resolved.clone());
        Ok(Resolution::Resolved(resolved))
    }

    /// Resolve as far as the data allows: the exact set over the known
    /// part of the span, plus the gaps that remain unknown.
    ///
    /// Within `span \ gaps` every leaf is fully known, so restricting the
    /// evaluation there is exact even under NOT. Used after a fetch pass
    /// that was allowed to leave gaps (warn/ignore policy). Partial
    /// results are not cached.
    pub fn resolve_partial(
        &self,
        name: &str,
        span: Interval,
        store: &FlagStore,
    ) -> Result<(IntervalSet, IntervalSet), ConfigError> {
        let def = self
            .definitions
            .get(name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown state '{name}'")))?;
        let gaps = leaf_gaps(&def.expr, span, store);
        let covered = def.expr.evaluate(store, span).difference(&gaps);
        Ok((covered, gaps))
    }

    /// Drop cached resolutions for every state whose expression mentions
    /// `flag`. Called after new flag data is merged; resolution is cheap
    /// relative to fetching, so invalidation is deliberately coarse.
    pub fn invalidate_flag(&mut self, flag: &str) {
        let affected: Vec<String> = self
            .definitions
            .values()
            .filter(|def| def.expr.flags().contains(flag))
            .map(|def| def.name.clone())
            .collect();
        self.cache
            .retain(|(name, _, _), _| !affected.iter().any(|a| a == name));
    }

    /// Drop cached resolutions for one state.
    pub fn invalidate_state(&mut self, name: &str) {
        self.cache.retain(|(cached, _, _), _| cached != name);
    }
}

/// Union of unknown time across all leaves of an expression within a span.
fn leaf_gaps(expr: &StateExpr, span: Interval, store: &FlagStore) -> IntervalSet {
    let mut gaps = IntervalSet::new();
    for flag in expr.flags() {
        gaps.merge(&store.query(&flag, span).gaps);
    }
    gaps
}
