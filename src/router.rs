//! Task type routing.
//!
//! Routes are tried in registration order and the first pattern matching
//! the task type wins. Lookups are memoized per type string, including
//! misses.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use regex::Regex;

use crate::error::ConfigError;
use crate::handler::{Handler, HandlerFactory};
use crate::task::AcquiredTask;

pub struct Router {
    routes: Vec<(Regex, Arc<dyn HandlerFactory>)>,
    cache: RwLock<HashMap<String, Option<usize>>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Route types containing `literal`.
    pub fn route(mut self, literal: &str, factory: impl HandlerFactory + 'static) -> Self {
        let pattern = Regex::new(&regex::escape(literal)).expect("escaped literal is a valid regex");
        self.add(pattern, Arc::new(factory));
        self
    }

    /// Route types matching `pattern`.
    pub fn route_regex(
        mut self,
        pattern: &str,
        factory: impl HandlerFactory + 'static,
    ) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| ConfigError::InvalidValue {
            key: "route".to_string(),
            message: format!("invalid pattern {pattern:?}: {e}"),
        })?;
        self.add(regex, Arc::new(factory));
        Ok(self)
    }

    /// Append a route. Clears the lookup cache.
    pub fn add(&mut self, pattern: Regex, factory: Arc<dyn HandlerFactory>) {
        self.routes.push((pattern, factory));
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Factory for `task_type`, if any route matches.
    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn HandlerFactory>> {
        let cached = self
            .cache
            .read()
            .ok()
            .and_then(|cache| cache.get(task_type).copied());

        let index = match cached {
            Some(index) => index,
            None => {
                let index = self
                    .routes
                    .iter()
                    .position(|(pattern, _)| pattern.is_match(task_type));
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(task_type.to_string(), index);
                }
                index
            }
        };
        index.map(|i| Arc::clone(&self.routes[i].1))
    }

    /// Build the handler for an acquired task.
    pub fn dispatch(&self, task: &AcquiredTask) -> Option<Arc<dyn Handler>> {
        self.resolve(task.task_type())
            .map(|factory| factory.create(task))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::HandlerError;
    use crate::monitor::MonitoredTask;

    struct Named(&'static str);

    #[async_trait]
    impl Handler for Named {
        async fn run(&self, _task: &MonitoredTask) -> Result<(), HandlerError> {
            Err(HandlerError::Failed(self.0.to_string()))
        }
    }

    fn factory(name: &'static str) -> impl HandlerFactory + 'static {
        move |_: &AcquiredTask| Named(name)
    }

    #[test]
    fn first_match_wins() {
        let router = Router::new()
            .route("mail", factory("mail"))
            .route_regex("^mail\\.bulk", factory("bulk"))
            .unwrap();
        assert!(router.resolve("mail.bulk").is_some());
        assert!(Arc::ptr_eq(
            &router.resolve("mail.bulk").unwrap(),
            &router.resolve("mail").unwrap()
        ));
    }

    #[test]
    fn literal_routes_match_substrings_not_regex() {
        let router = Router::new().route("a.b", factory("dot"));
        assert!(router.resolve("xa.by").is_some());
        assert!(router.resolve("axb").is_none());
    }

    #[test]
    fn misses_are_cached() {
        let router = Router::new().route("known", factory("known"));
        assert!(router.resolve("other").is_none());
        assert_eq!(router.cache.read().unwrap().get("other"), Some(&None));
    }

    #[test]
    fn adding_a_route_clears_cache() {
        let mut router = Router::new();
        assert!(router.resolve("late").is_none());
        router.add(Regex::new("late").unwrap(), Arc::new(factory("late")));
        assert!(router.resolve("late").is_some());
    }

    #[test]
    fn bad_regex_is_config_error() {
        assert!(Router::new().route_regex("(", factory("x")).is_err());
    }
}
