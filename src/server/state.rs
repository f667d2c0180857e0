use crate::capability;
use crate::config::GatewayConfig;
use crate::door::Door;
use crate::limit::SlidingWindowLimiter;
use crate::metrics::Metrics;
use crate::registry::Registry;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;

/// Shared gateway state, cheaply cloneable into the per-connection service.
///
/// Built once at startup and passed by reference everywhere — there are no
/// module-level singletons. Doors are owned by `doors` and never hold a
/// reference back to this struct; the admin handlers receive the limiter
/// and registry through here instead.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<Registry>,
    doors: Arc<DashMap<String, Arc<Door>>>,
    /// Per-IP window over all admin operations.
    pub admin_limiter: Arc<SlidingWindowLimiter>,
    /// Per-IP window over registrations specifically.
    pub registration_limiter: Arc<SlidingWindowLimiter>,
    /// Shared outbound client for spec fetches and capability calls.
    pub http: reqwest::Client,
    pub metrics: Metrics,
}

impl GatewayState {
    pub fn new(config: Arc<GatewayConfig>, registry: Arc<Registry>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let admin_limiter = Arc::new(SlidingWindowLimiter::new());
        admin_limiter.start_compaction();
        let registration_limiter = Arc::new(SlidingWindowLimiter::new());
        registration_limiter.start_compaction();

        let metrics = Metrics::install();

        Ok(Self {
            config,
            registry,
            doors: Arc::new(DashMap::new()),
            admin_limiter,
            registration_limiter,
            http,
            metrics,
        })
    }

    pub fn door(&self, slug: &str) -> Option<Arc<Door>> {
        self.doors.get(slug).map(|d| d.value().clone())
    }

    pub fn door_count(&self) -> usize {
        self.doors.len()
    }

    /// Install a door. The entry must be visible to dispatch before the
    /// registration response is sent; `DashMap::insert` gives us that.
    pub fn insert_door(&self, slug: String, door: Arc<Door>) {
        self.doors.insert(slug, door);
        metrics::gauge!("gateway_tenants").set(self.doors.len() as f64);
    }

    /// Remove and destroy a door. In-flight requests already holding the
    /// `Arc` finish normally; new lookups miss.
    pub fn remove_door(&self, slug: &str) -> bool {
        let removed = self.doors.remove(slug);
        let existed = removed.is_some();
        if let Some((_, door)) = removed {
            door.destroy();
        }
        metrics::gauge!("gateway_tenants").set(self.doors.len() as f64);
        existed
    }

    /// Rebuild doors for every persisted registration. A tenant that fails
    /// to restore (spec no longer parses or compiles) is logged and
    /// skipped; startup never aborts over one bad record.
    pub async fn restore_from_registry(&self) -> usize {
        let mut restored = 0;
        for reg in self.registry.list_with_specs().await {
            let slug = reg.slug.clone();
            let spec: serde_json::Value = match serde_json::from_str(&reg.spec_json) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        "restore: persisted spec no longer parses, skipping, slug={}, error={}",
                        slug,
                        e
                    );
                    continue;
                }
            };
            let caps = match capability::compile(&spec) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(
                        "restore: capability compile failed, skipping, slug={}, error={}",
                        slug,
                        e
                    );
                    continue;
                }
            };

            let door = Door::new(reg, caps, self.config.clone(), self.http.clone());
            tracing::info!(
                "restore: tenant restored, slug={}, capabilities={}",
                slug,
                door.capability_count()
            );
            self.insert_door(slug, door);
            restored += 1;
        }
        restored
    }

    /// Ordered teardown: destroy every door, stop the admin windows, close
    /// the registry.
    pub fn shutdown(&self) {
        for entry in self.doors.iter() {
            entry.value().destroy();
        }
        self.doors.clear();
        self.admin_limiter.destroy();
        self.registration_limiter.destroy();
        self.registry.close();
        tracing::info!("server: state torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::registry::SiteRegistration;

    fn reg(slug: &str, spec_json: &str) -> SiteRegistration {
        SiteRegistration {
            slug: slug.to_string(),
            site_name: slug.to_string(),
            site_url: "https://a.example.com".to_string(),
            api_url: "https://api.example.com".to_string(),
            open_api_url: None,
            rate_limit: 60,
            created_at: Utc::now(),
            spec_json: spec_json.to_string(),
        }
    }

    #[tokio::test]
    async fn restore_skips_bad_records() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path()).await.unwrap());
        registry
            .register(reg(
                "good",
                r#"{"openapi":"3.0.0","paths":{"/x":{"get":{"operationId":"x"}}}}"#,
            ))
            .await
            .unwrap();
        registry.register(reg("broken", "not json at all")).await.unwrap();
        registry
            .register(reg("no-paths", r#"{"openapi":"3.0.0"}"#))
            .await
            .unwrap();

        let state =
            GatewayState::new(Arc::new(GatewayConfig::default()), registry).unwrap();
        let restored = state.restore_from_registry().await;

        assert_eq!(restored, 1);
        assert!(state.door("good").is_some());
        assert!(state.door("broken").is_none());
        assert!(state.door("no-paths").is_none());
    }

    #[tokio::test]
    async fn insert_and_remove_door() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path()).await.unwrap());
        let state =
            GatewayState::new(Arc::new(GatewayConfig::default()), registry).unwrap();

        let caps = capability::compile(&serde_json::json!({
            "paths": {"/x": {"get": {"operationId": "x"}}}
        }))
        .unwrap();
        let door = Door::new(
            reg("s1", "{}"),
            caps,
            state.config.clone(),
            state.http.clone(),
        );
        state.insert_door("s1".to_string(), door);

        assert_eq!(state.door_count(), 1);
        assert!(state.remove_door("s1"));
        assert!(!state.remove_door("s1"));
        assert!(state.door("s1").is_none());
    }
}
