use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

fn default_rate_limit() -> u32 {
    60
}

/// Persisted tenant record. `spec_json` keeps the OpenAPI document exactly
/// as retrieved at registration so restarts recompile from the same bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRegistration {
    pub slug: String,
    pub site_name: String,
    pub site_url: String,
    /// Upstream base URL, trailing slash stripped.
    pub api_url: String,
    /// Explicit spec URL; `None` means `api_url + "/openapi.json"`.
    #[serde(default)]
    pub open_api_url: Option<String>,
    /// Requests per minute per client IP, in [1, 1000].
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    pub created_at: DateTime<Utc>,
    pub spec_json: String,
}

impl SiteRegistration {
    /// The URL the OpenAPI descriptor was (and would again be) fetched from.
    pub fn spec_url(&self) -> String {
        match self.open_api_url {
            Some(ref u) => u.clone(),
            None => format!("{}/openapi.json", self.api_url),
        }
    }
}

/// Projection returned by `GET /sites` — everything except the spec payload.
#[derive(Debug, Clone, Serialize)]
pub struct SiteSummary {
    pub slug: String,
    pub site_name: String,
    pub site_url: String,
    pub api_url: String,
    pub rate_limit: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&SiteRegistration> for SiteSummary {
    fn from(r: &SiteRegistration) -> Self {
        Self {
            slug: r.slug.clone(),
            site_name: r.site_name.clone(),
            site_url: r.site_url.clone(),
            api_url: r.api_url.clone(),
            rate_limit: r.rate_limit,
            created_at: r.created_at,
        }
    }
}

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    sites: Vec<SiteRegistration>,
}

/// Durable slug → registration store backed by a single JSON file.
///
/// Every mutation rewrites the whole document to a sibling temp file and
/// renames it over the live one, so a crash leaves either the old or the
/// new state — never a torn write. Mutations serialize behind one async
/// mutex; callers read from the in-memory image.
pub struct Registry {
    path: PathBuf,
    sites: Mutex<Vec<SiteRegistration>>,
    closed: AtomicBool,
}

impl Registry {
    /// Open (or create) the registry under `data_dir`. A corrupt backing
    /// file degrades to an empty registry with a logged warning; only I/O
    /// errors creating the directory are fatal.
    pub async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join("registry.json");

        let sites = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<RegistryDocument>(&bytes) {
                Ok(doc) => doc.sites,
                Err(e) => {
                    tracing::warn!(
                        "registry: corrupt backing file, starting empty, path={}, error={}",
                        path.display(),
                        e
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(
                    "registry: unreadable backing file, starting empty, path={}, error={}",
                    path.display(),
                    e
                );
                Vec::new()
            }
        };

        tracing::info!(
            "registry: opened, path={}, sites={}",
            path.display(),
            sites.len()
        );

        Ok(Self {
            path,
            sites: Mutex::new(sites),
            closed: AtomicBool::new(false),
        })
    }

    /// Insert or replace a registration and persist.
    pub async fn register(&self, reg: SiteRegistration) -> Result<(), GatewayError> {
        let mut sites = self.sites.lock().await;
        sites.retain(|s| s.slug != reg.slug);
        sites.push(reg);
        self.persist(&sites).await
    }

    pub async fn get(&self, slug: &str) -> Option<SiteRegistration> {
        let sites = self.sites.lock().await;
        sites.iter().find(|s| s.slug == slug).cloned()
    }

    /// Summaries ordered by `created_at` ascending; ties keep insertion
    /// order (the sort is stable over the insertion-ordered image).
    pub async fn list(&self) -> Vec<SiteSummary> {
        let sites = self.sites.lock().await;
        let mut out: Vec<SiteSummary> = sites.iter().map(SiteSummary::from).collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    /// Full records (spec payload included), same ordering as `list`.
    pub async fn list_with_specs(&self) -> Vec<SiteRegistration> {
        let sites = self.sites.lock().await;
        let mut out = sites.clone();
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub async fn len(&self) -> usize {
        self.sites.lock().await.len()
    }

    /// Remove a registration; returns whether it existed. Persists only
    /// when something was removed.
    pub async fn delete(&self, slug: &str) -> Result<bool, GatewayError> {
        let mut sites = self.sites.lock().await;
        let before = sites.len();
        sites.retain(|s| s.slug != slug);
        if sites.len() == before {
            return Ok(false);
        }
        self.persist(&sites).await?;
        Ok(true)
    }

    /// Mark the registry closed. Every mutation already reached disk, so
    /// this only flips the flag and logs; later mutations are rejected.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("registry: closed, path={}", self.path.display());
        }
    }

    /// Write-to-temp-then-rename so the document is replaced atomically.
    async fn persist(&self, sites: &[SiteRegistration]) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Internal(
                "registry is closed".to_string(),
            ));
        }

        let doc = RegistryDocument {
            sites: sites.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| GatewayError::Internal(format!("registry serialize: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| {
            GatewayError::Internal(format!("registry write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            GatewayError::Internal(format!("registry rename {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reg(slug: &str, created_secs: i64) -> SiteRegistration {
        SiteRegistration {
            slug: slug.to_string(),
            site_name: format!("Site {}", slug),
            site_url: format!("https://{}.example.com", slug),
            api_url: format!("https://api.{}.example.com", slug),
            open_api_url: None,
            rate_limit: 60,
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
            spec_json: r#"{"openapi":"3.0.0","paths":{"/x":{"get":{}}}}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn register_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).await.unwrap();

        registry.register(reg("s1", 100)).await.unwrap();
        let got = registry.get("s1").await.expect("registered site");
        assert_eq!(got.site_name, "Site s1");
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn write_then_read_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = Registry::open(dir.path()).await.unwrap();
            registry.register(reg("s1", 100)).await.unwrap();
            registry.register(reg("s2", 200)).await.unwrap();
        }

        let reopened = Registry::open(dir.path()).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        let got = reopened.get("s1").await.unwrap();
        assert_eq!(got.api_url, "https://api.s1.example.com");
        assert!(got.spec_json.contains("openapi"));
    }

    #[tokio::test]
    async fn register_replaces_existing_slug() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).await.unwrap();

        registry.register(reg("s1", 100)).await.unwrap();
        let mut updated = reg("s1", 300);
        updated.site_name = "Renamed".to_string();
        registry.register(updated).await.unwrap();

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("s1").await.unwrap().site_name, "Renamed");
    }

    #[tokio::test]
    async fn delete_then_reregister() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).await.unwrap();

        registry.register(reg("s1", 100)).await.unwrap();
        assert!(registry.delete("s1").await.unwrap());
        assert!(registry.get("s1").await.is_none());
        assert!(!registry.delete("s1").await.unwrap());

        registry.register(reg("s1", 200)).await.unwrap();
        assert!(registry.get("s1").await.is_some());
    }

    #[tokio::test]
    async fn list_orders_by_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).await.unwrap();

        registry.register(reg("later", 500)).await.unwrap();
        registry.register(reg("earlier", 100)).await.unwrap();
        registry.register(reg("middle", 300)).await.unwrap();

        let slugs: Vec<String> = registry.list().await.into_iter().map(|s| s.slug).collect();
        assert_eq!(slugs, vec!["earlier", "middle", "later"]);
    }

    #[tokio::test]
    async fn corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("registry.json"), b"{not json")
            .await
            .unwrap();

        let registry = Registry::open(dir.path()).await.unwrap();
        assert_eq!(registry.len().await, 0);
        // And the registry is usable afterwards.
        registry.register(reg("s1", 100)).await.unwrap();
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn persist_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).await.unwrap();
        registry.register(reg("s1", 100)).await.unwrap();

        assert!(dir.path().join("registry.json").exists());
        assert!(!dir.path().join("registry.json.tmp").exists());
    }

    #[tokio::test]
    async fn close_rejects_further_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).await.unwrap();
        registry.register(reg("s1", 100)).await.unwrap();
        registry.close();
        assert!(registry.register(reg("s2", 200)).await.is_err());
    }
}
