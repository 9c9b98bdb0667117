//! Route table: compiled action patterns resolved in declaration order.
//!
//! A string action is compiled as follows:
//!
//! - `^...` is taken as a regular expression (a trailing `$` is added if
//!   missing)
//! - anything else is a literal in which each `*` matches one word
//!   segment (`\w+`); every other character, `$` and `.` included, is
//!   matched literally
//!
//! An empty table passes every action through with no route middleware.

use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;
use wsgate_settings::RouteSettings;

use crate::middleware::MiddlewareRef;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid route pattern '{action}': {source}")]
    InvalidPattern {
        action: String,
        #[source]
        source: regex::Error,
    },
}

/// How a route matches action names.
#[derive(Clone, Debug)]
pub enum ActionMatcher {
    /// Literal, `*` glob, or `^`-prefixed regex source.
    Pattern(String),
    /// Pre-built expression, used as-is.
    Regex(Regex),
}

impl From<&str> for ActionMatcher {
    fn from(value: &str) -> Self {
        Self::Pattern(value.to_owned())
    }
}

impl From<String> for ActionMatcher {
    fn from(value: String) -> Self {
        Self::Pattern(value)
    }
}

impl From<Regex> for ActionMatcher {
    fn from(value: Regex) -> Self {
        Self::Regex(value)
    }
}

/// Uncompiled route, as supplied by configuration or code.
#[derive(Clone, Debug)]
pub struct RouteDescriptor {
    pub action: ActionMatcher,
    pub middlewares: Vec<MiddlewareRef>,
    /// Dispatch to a process-internal action.
    pub local: bool,
    /// Do not wait for the backend result.
    pub is_async: bool,
}

impl RouteDescriptor {
    pub fn new(action: impl Into<ActionMatcher>) -> Self {
        Self {
            action: action.into(),
            middlewares: Vec::new(),
            local: false,
            is_async: false,
        }
    }

    #[must_use]
    pub fn middleware(mut self, middleware: impl Into<MiddlewareRef>) -> Self {
        self.middlewares.push(middleware.into());
        self
    }

    #[must_use]
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }
}

impl From<&RouteSettings> for RouteDescriptor {
    fn from(settings: &RouteSettings) -> Self {
        Self {
            action: ActionMatcher::Pattern(settings.action.clone()),
            middlewares: settings
                .middlewares
                .iter()
                .map(|name| MiddlewareRef::Named(name.clone()))
                .collect(),
            local: settings.local,
            is_async: settings.is_async,
        }
    }
}

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pattern: Regex,
    pub middlewares: Vec<MiddlewareRef>,
    pub local: bool,
    pub is_async: bool,
}

impl Route {
    pub fn compile(descriptor: RouteDescriptor) -> Result<Self, RouteError> {
        let pattern = match descriptor.action {
            ActionMatcher::Regex(re) => re,
            ActionMatcher::Pattern(action) => {
                compile_action(&action).map_err(|source| RouteError::InvalidPattern {
                    action,
                    source,
                })?
            }
        };
        Ok(Self {
            pattern,
            middlewares: descriptor.middlewares,
            local: descriptor.local,
            is_async: descriptor.is_async,
        })
    }

    /// The compiled expression source.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, action: &str) -> bool {
        self.pattern.is_match(action)
    }
}

/// Compile an action string into an anchored expression.
pub fn compile_action(action: &str) -> Result<Regex, regex::Error> {
    if action.starts_with('^') {
        if action.ends_with('$') {
            return Regex::new(action);
        }
        return Regex::new(&format!("{action}$"));
    }

    let body = action
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\w+");
    Regex::new(&format!("^{body}$"))
}

/// Result of resolving an action name.
#[derive(Clone, Debug)]
pub enum Resolution {
    /// First route whose pattern matched.
    Matched(Arc<Route>),
    /// The table is empty; every action is accepted.
    PassThrough,
    /// Routes are configured and none matched.
    NotFound,
}

/// Ordered list of compiled routes.
///
/// Routes are appended at startup and by administrative calls afterwards;
/// resolution takes a read lock for the duration of one linear scan.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<Vec<Arc<Route>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every descriptor in order.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = RouteDescriptor>,
    ) -> Result<Self, RouteError> {
        let table = Self::new();
        for descriptor in descriptors {
            table.add_route(descriptor)?;
        }
        Ok(table)
    }

    /// Compile `descriptor` and append it after existing routes.
    pub fn add_route(&self, descriptor: RouteDescriptor) -> Result<(), RouteError> {
        let route = Route::compile(descriptor)?;
        debug!(pattern = route.pattern(), local = route.local, is_async = route.is_async, "route added");
        self.routes.write().push(Arc::new(route));
        Ok(())
    }

    /// First route matching the full action name.
    pub fn resolve(&self, action: &str) -> Resolution {
        let routes = self.routes.read();
        if routes.is_empty() {
            return Resolution::PassThrough;
        }
        routes
            .iter()
            .find(|route| route.matches(action))
            .map_or(Resolution::NotFound, |route| {
                Resolution::Matched(route.clone())
            })
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn table(actions: &[&str]) -> RouteTable {
        RouteTable::from_descriptors(actions.iter().map(|a| RouteDescriptor::new(*a))).unwrap()
    }

    fn matched_pattern(table: &RouteTable, action: &str) -> Option<String> {
        match table.resolve(action) {
            Resolution::Matched(route) => Some(route.pattern().to_owned()),
            _ => None,
        }
    }

    #[test]
    fn first_declared_route_wins() {
        let t = table(&["*.*", "ping.pong"]);
        assert_eq!(matched_pattern(&t, "ping.pong").as_deref(), Some(r"^\w+\.\w+$"));
    }

    #[test]
    fn literal_route_matches_exactly() {
        let t = table(&["users.list"]);
        assert!(matched_pattern(&t, "users.list").is_some());
        assert_matches!(t.resolve("users.lists"), Resolution::NotFound);
        assert_matches!(t.resolve("xusers.list"), Resolution::NotFound);
        assert_matches!(t.resolve("usersXlist"), Resolution::NotFound);
    }

    #[test]
    fn wildcard_matches_one_segment() {
        let t = table(&["users.*"]);
        assert!(matched_pattern(&t, "users.get").is_some());
        assert_matches!(t.resolve("users.get.all"), Resolution::NotFound);
        assert_matches!(t.resolve("users."), Resolution::NotFound);
    }

    #[test]
    fn dollar_prefixed_action_is_literal() {
        let t = table(&["$node.actions"]);
        assert!(matched_pattern(&t, "$node.actions").is_some());
        assert_matches!(t.resolve("node.actions"), Resolution::NotFound);
    }

    #[test]
    fn dollar_prefixed_wildcard() {
        let t = table(&["$node.*"]);
        assert!(matched_pattern(&t, "$node.health").is_some());
        assert!(matched_pattern(&t, "$node.list").is_some());
    }

    #[test]
    fn caret_pattern_is_raw_regex() {
        let t = table(&["^users\\.[0-9]+"]);
        assert_eq!(matched_pattern(&t, "users.42").as_deref(), Some(r"^users\.[0-9]+$"));
        assert_matches!(t.resolve("users.42x"), Resolution::NotFound);
    }

    #[test]
    fn prebuilt_regex_used_as_is() {
        let re = Regex::new("^orders\\.(create|cancel)$").unwrap();
        let t = RouteTable::from_descriptors([RouteDescriptor::new(re)]).unwrap();
        assert!(matched_pattern(&t, "orders.cancel").is_some());
        assert_matches!(t.resolve("orders.update"), Resolution::NotFound);
    }

    #[test]
    fn empty_table_passes_through() {
        let t = RouteTable::new();
        assert!(t.is_empty());
        assert_matches!(t.resolve("anything.at.all"), Resolution::PassThrough);
    }

    #[test]
    fn add_route_appends_after_existing() {
        let t = table(&["ping.pong"]);
        t.add_route(RouteDescriptor::new("*.*").local()).unwrap();
        assert_eq!(t.len(), 2);
        let Resolution::Matched(route) = t.resolve("echo.hi") else {
            panic!("expected match");
        };
        assert!(route.local);
        let Resolution::Matched(route) = t.resolve("ping.pong") else {
            panic!("expected match");
        };
        assert!(!route.local);
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = RouteTable::new()
            .add_route(RouteDescriptor::new("^users.(["))
            .unwrap_err();
        assert!(err.to_string().contains("users.(["));
    }

    #[test]
    fn descriptor_from_settings_keeps_flags_and_names() {
        let settings = RouteSettings {
            action: "jobs.*".into(),
            middlewares: vec!["auth".into(), "audit".into()],
            local: true,
            is_async: true,
        };
        let route = Route::compile(RouteDescriptor::from(&settings)).unwrap();
        assert!(route.local);
        assert!(route.is_async);
        let names: Vec<_> = route
            .middlewares
            .iter()
            .map(|m| match m {
                MiddlewareRef::Named(n) => n.clone(),
                MiddlewareRef::Inline(_) => "<inline>".into(),
            })
            .collect();
        assert_eq!(names, vec!["auth", "audit"]);
    }
}
