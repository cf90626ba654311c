//! Handler registry keyed by handler key.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::HandlerError;
use crate::handlers::{Handler, JobTypeRegistration};
use crate::store::JobStore;

/// A job type resolved to its registration and an invocable handler.
#[derive(Clone)]
pub struct ResolvedType {
    pub registration: JobTypeRegistration,
    pub handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for ResolvedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedType")
            .field("registration", &self.registration)
            .field("handler", &self.handler.key())
            .finish()
    }
}

/// Registry of handler implementations, populated at startup.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any previous one with the same key.
    pub async fn register(&self, handler: Arc<dyn Handler>) {
        let key = handler.key().to_string();
        if self.handlers.write().await.insert(key.clone(), handler).is_some() {
            tracing::warn!(handler = %key, "Replaced existing handler registration");
        } else {
            tracing::debug!("Registered handler: {}", key);
        }
    }

    /// Get a handler by key.
    pub async fn get(&self, key: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().await.get(key).cloned()
    }

    /// List all handler keys.
    pub async fn list(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }

    /// Resolve a job type name through the store's type registry.
    ///
    /// Unknown and disabled types are typed errors; nothing is invoked.
    pub async fn resolve(
        &self,
        store: &dyn JobStore,
        type_name: &str,
    ) -> Result<ResolvedType, HandlerError> {
        let registration =
            store
                .get_job_type(type_name)
                .await?
                .ok_or_else(|| HandlerError::NotFound {
                    name: type_name.to_string(),
                })?;

        if !registration.enabled {
            return Err(HandlerError::Disabled {
                name: type_name.to_string(),
            });
        }

        let handler =
            self.get(&registration.handler_key)
                .await
                .ok_or_else(|| HandlerError::MissingHandler {
                    name: type_name.to_string(),
                    handler_key: registration.handler_key.clone(),
                })?;

        Ok(ResolvedType {
            registration,
            handler,
        })
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
