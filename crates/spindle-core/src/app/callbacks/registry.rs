use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::ports::failure_callback::FailureCallback;

/// Registry of named failure callbacks (name -> callback).
///
/// Design:
/// - Shared between the facade (register) and every executor (lookup), so
///   it sits behind a `RwLock`; lookups clone the `Arc` and release the
///   lock before the callback is awaited.
/// - `register` is "last wins".
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<String, Arc<dyn FailureCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a callback under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, callback: Arc<dyn FailureCallback>) {
        let name = name.into();
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if callbacks.insert(name.clone(), callback).is_some() {
            tracing::debug!(callback = %name, "replaced failure callback");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FailureCallback>> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::callback::FailureContext;
    use crate::ports::failure_callback::{CallbackError, sync_callback_fn};

    fn ok() -> Arc<dyn FailureCallback> {
        Arc::new(sync_callback_fn(|_ctx: &FailureContext| Ok(())))
    }

    fn failing() -> Arc<dyn FailureCallback> {
        Arc::new(sync_callback_fn(|_ctx: &FailureContext| {
            Err(CallbackError::Failed("nope".to_string()))
        }))
    }

    #[test]
    fn list_names_is_sorted() {
        let reg = CallbackRegistry::new();
        reg.register("zeta", ok());
        reg.register("audit", ok());
        reg.register("metrics", ok());
        assert_eq!(reg.list_names(), vec!["audit", "metrics", "zeta"]);
        assert_eq!(reg.len(), 3);
    }

    #[tokio::test]
    async fn register_overwrites_existing_name() {
        let reg = CallbackRegistry::new();
        reg.register("audit", failing());
        reg.register("audit", ok());
        assert_eq!(reg.len(), 1);

        let ctx = crate::app::callbacks::builtin::tests::context(0, 3);
        let callback = reg.get("audit").unwrap();
        assert!(callback.on_failure(&ctx).await.is_ok());
    }

    #[test]
    fn missing_name_is_none() {
        let reg = CallbackRegistry::new();
        assert!(reg.is_empty());
        assert!(reg.get("missing").is_none());
    }
}
