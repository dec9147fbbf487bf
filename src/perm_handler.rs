//! In-memory instance permission registry

use std::collections::HashMap;

use async_trait::async_trait;
use iam_proto::InstanceIdent;
use iam_server::{PermHandler, ServiceError};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default number of registered instances
pub const DEFAULT_MAX_INSTANCES: usize = 128;

type InstanceKey = (String, String, u64);

fn key(instance: &InstanceIdent) -> InstanceKey {
    (
        instance.service_id.clone(),
        instance.subject_id.clone(),
        instance.instance,
    )
}

struct Registration {
    secret: String,
    instance: InstanceIdent,
    permissions: HashMap<String, HashMap<String, String>>,
}

/// [`PermHandler`] issuing a random secret per registered instance
///
/// Registering an instance that is already known returns its existing
/// secret.
pub struct MemoryPermHandler {
    capacity: usize,
    registrations: Mutex<HashMap<InstanceKey, Registration>>,
}

impl Default for MemoryPermHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INSTANCES)
    }
}

impl MemoryPermHandler {
    /// Create a registry holding at most `capacity` instances
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            registrations: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PermHandler for MemoryPermHandler {
    async fn register_instance(
        &self,
        instance: InstanceIdent,
        permissions: HashMap<String, HashMap<String, String>>,
    ) -> Result<String, ServiceError> {
        let mut registrations = self.registrations.lock();
        let key = key(&instance);

        if let Some(existing) = registrations.get(&key) {
            debug!(service_id = %instance.service_id, "Instance already registered");
            return Ok(existing.secret.clone());
        }

        if registrations.len() >= self.capacity {
            warn!(service_id = %instance.service_id, capacity = self.capacity, "Permission registry is full");
            return Err(ServiceError::ResourceExhausted(
                "max registered instances reached".to_string(),
            ));
        }

        let secret = Uuid::new_v4().to_string();

        debug!(
            service_id = %instance.service_id,
            subject_id = %instance.subject_id,
            instance = instance.instance,
            "Instance registered"
        );

        registrations.insert(
            key,
            Registration {
                secret: secret.clone(),
                instance,
                permissions,
            },
        );

        Ok(secret)
    }

    async fn unregister_instance(&self, instance: &InstanceIdent) -> Result<(), ServiceError> {
        self.registrations
            .lock()
            .remove(&key(instance))
            .map(|_| ())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("instance {}", instance.service_id))
            })
    }

    async fn get_permissions(
        &self,
        secret: &str,
        functional_server_id: &str,
    ) -> Result<(InstanceIdent, HashMap<String, String>), ServiceError> {
        let registrations = self.registrations.lock();

        let registration = registrations
            .values()
            .find(|r| r.secret == secret)
            .ok_or_else(|| ServiceError::NotFound("secret".to_string()))?;

        let permissions = registration
            .permissions
            .get(functional_server_id)
            .cloned()
            .ok_or_else(|| {
                ServiceError::NotFound(format!("functional server {}", functional_server_id))
            })?;

        Ok((registration.instance.clone(), permissions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(n: u64) -> InstanceIdent {
        InstanceIdent {
            service_id: "service1".to_string(),
            subject_id: "subject1".to_string(),
            instance: n,
        }
    }

    fn permissions() -> HashMap<String, HashMap<String, String>> {
        HashMap::from([(
            "vis".to_string(),
            HashMap::from([("*".to_string(), "rw".to_string())]),
        )])
    }

    #[tokio::test]
    async fn registered_secret_resolves_permissions() {
        let handler = MemoryPermHandler::default();

        let secret = handler
            .register_instance(instance(0), permissions())
            .await
            .expect("register");

        let (ident, perms) = handler.get_permissions(&secret, "vis").await.expect("perms");
        assert_eq!(ident, instance(0));
        assert_eq!(perms.get("*").map(String::as_str), Some("rw"));

        assert!(matches!(
            handler.get_permissions(&secret, "other").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn re_registration_returns_same_secret() {
        let handler = MemoryPermHandler::default();

        let first = handler
            .register_instance(instance(0), permissions())
            .await
            .expect("register");
        let second = handler
            .register_instance(instance(0), HashMap::new())
            .await
            .expect("register");

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn capacity_overflow_is_resource_exhausted() {
        let handler = MemoryPermHandler::new(1);

        handler
            .register_instance(instance(0), permissions())
            .await
            .expect("register");

        assert!(matches!(
            handler.register_instance(instance(1), permissions()).await,
            Err(ServiceError::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn unregister_forgets_secret() {
        let handler = MemoryPermHandler::default();
        let secret = handler
            .register_instance(instance(0), permissions())
            .await
            .expect("register");

        handler.unregister_instance(&instance(0)).await.expect("unregister");

        assert!(handler.get_permissions(&secret, "vis").await.is_err());
        assert!(matches!(
            handler.unregister_instance(&instance(0)).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
