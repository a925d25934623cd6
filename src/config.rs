//! # Configuration
//!
//! Layered configuration for the storage client: compiled-in defaults,
//! an optional TOML file, environment variables, and explicit builder
//! overrides, applied in that order of increasing priority. This mirrors
//! the way the rest of this codebase turns CLI-ish input into a validated
//! internal configuration struct before anything else is allowed to run.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::distribution::DistributionStrategy;
use crate::error::{CoreError, CoreResult};

/// Default per-server pool cap.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// Default block size for round-robin distribution (512 KiB).
pub const DEFAULT_STRIPE_SIZE: u64 = 512 * 1024;

/// Default lock-acquisition retry budget.
pub const DEFAULT_LOCK_RETRY_BUDGET: Duration = Duration::from_secs(2);

/// A `host:port` pair identifying one backend server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn parse(spec: &str) -> CoreResult<Self> {
        let (host, port) = spec
            .rsplit_once(':')
            .ok_or_else(|| CoreError::Config(format!("invalid server address: {spec}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| CoreError::Config(format!("invalid port in server address: {spec}")))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn display(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Semantics template applied to newly constructed batches unless
/// overridden by the caller. See [`crate::batch::Semantics`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SemanticsTemplate {
    pub atomicity: crate::batch::Atomicity,
    pub concurrency: crate::batch::Concurrency,
    pub consistency: crate::batch::Consistency,
    pub safety: crate::batch::Safety,
    pub ordering: crate::batch::Ordering,
    pub persistency: crate::batch::Persistency,
}

impl Default for SemanticsTemplate {
    fn default() -> Self {
        Self {
            atomicity: crate::batch::Atomicity::Operation,
            concurrency: crate::batch::Concurrency::None,
            consistency: crate::batch::Consistency::Eventual,
            safety: crate::batch::Safety::Network,
            ordering: crate::batch::Ordering::Semi,
            persistency: crate::batch::Persistency::Eventual,
        }
    }
}

/// The recognized configuration options.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub object_servers: Vec<ServerAddr>,
    pub kv_servers: Vec<ServerAddr>,
    pub db_servers: Vec<ServerAddr>,
    pub max_connections: usize,
    pub stripe_size: u64,
    pub distribution: DistributionStrategy,
    pub semantics: SemanticsTemplate,
}

/// Raw, partially-populated view of a TOML config file. Every field is
/// optional so the file only needs to mention what it overrides.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    servers: Option<FileServers>,
    max_connections: Option<usize>,
    stripe_size: Option<u64>,
    semantics: Option<FileSemantics>,
}

#[derive(Debug, Default, Deserialize)]
struct FileServers {
    object: Option<Vec<String>>,
    kv: Option<Vec<String>>,
    db: Option<Vec<String>>,
}

/// Partial [`SemanticsTemplate`] as read from a `[semantics]` table —
/// every field optional, same shape as [`FileServers`], since a file only
/// needs to mention the dimensions it overrides.
#[derive(Debug, Default, Deserialize)]
struct FileSemantics {
    atomicity: Option<crate::batch::Atomicity>,
    concurrency: Option<crate::batch::Concurrency>,
    consistency: Option<crate::batch::Consistency>,
    safety: Option<crate::batch::Safety>,
    ordering: Option<crate::batch::Ordering>,
    persistency: Option<crate::batch::Persistency>,
}

/// Builds a [`Configuration`] from defaults, an optional file, environment
/// variables (`FABRIC_STORE_*`), and explicit overrides, validating the
/// result before returning it.
#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    object_servers: Option<Vec<String>>,
    kv_servers: Option<Vec<String>>,
    db_servers: Option<Vec<String>>,
    max_connections: Option<usize>,
    stripe_size: Option<u64>,
    semantics: FileSemantics,
    /// A whole-template override via [`Self::semantics`], taking priority
    /// over the per-dimension layering in `semantics` above.
    semantics_override: Option<SemanticsTemplate>,
}

impl ConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_servers(mut self, servers: Vec<String>) -> Self {
        self.object_servers = Some(servers);
        self
    }

    pub fn kv_servers(mut self, servers: Vec<String>) -> Self {
        self.kv_servers = Some(servers);
        self
    }

    pub fn db_servers(mut self, servers: Vec<String>) -> Self {
        self.db_servers = Some(servers);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn stripe_size(mut self, size: u64) -> Self {
        self.stripe_size = Some(size);
        self
    }

    /// Overrides the whole semantics template at once, taking priority
    /// over any `[semantics]` table from a file or `FABRIC_STORE_SEMANTICS_*`
    /// environment variable regardless of call order.
    pub fn semantics(mut self, semantics: SemanticsTemplate) -> Self {
        self.semantics_override = Some(semantics);
        self
    }

    /// Merge in a TOML config file. Missing file is not an error; a
    /// malformed one is.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(self);
        }
        let text = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("reading {}: {e}", path.display())))?;
        let file: FileConfig = toml::from_str(&text)
            .map_err(|e| CoreError::Config(format!("parsing {}: {e}", path.display())))?;

        if let Some(servers) = file.servers {
            if self.object_servers.is_none() {
                self.object_servers = servers.object;
            }
            if self.kv_servers.is_none() {
                self.kv_servers = servers.kv;
            }
            if self.db_servers.is_none() {
                self.db_servers = servers.db;
            }
        }
        if self.max_connections.is_none() {
            self.max_connections = file.max_connections;
        }
        if self.stripe_size.is_none() {
            self.stripe_size = file.stripe_size;
        }
        if let Some(semantics) = file.semantics {
            if self.semantics.atomicity.is_none() {
                self.semantics.atomicity = semantics.atomicity;
            }
            if self.semantics.concurrency.is_none() {
                self.semantics.concurrency = semantics.concurrency;
            }
            if self.semantics.consistency.is_none() {
                self.semantics.consistency = semantics.consistency;
            }
            if self.semantics.safety.is_none() {
                self.semantics.safety = semantics.safety;
            }
            if self.semantics.ordering.is_none() {
                self.semantics.ordering = semantics.ordering;
            }
            if self.semantics.persistency.is_none() {
                self.semantics.persistency = semantics.persistency;
            }
        }
        Ok(self)
    }

    /// Merge in environment variable overrides. Environment variables take
    /// priority over both defaults and the file, but not over explicit
    /// builder calls made after this one.
    pub fn with_env(mut self) -> Self {
        if let Ok(v) = env::var("FABRIC_STORE_OBJECT_SERVERS") {
            self.object_servers = Some(split_csv(&v));
        }
        if let Ok(v) = env::var("FABRIC_STORE_KV_SERVERS") {
            self.kv_servers = Some(split_csv(&v));
        }
        if let Ok(v) = env::var("FABRIC_STORE_DB_SERVERS") {
            self.db_servers = Some(split_csv(&v));
        }
        if let Ok(v) = env::var("FABRIC_STORE_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.max_connections = Some(n);
            }
        }
        if let Ok(v) = env::var("FABRIC_STORE_STRIPE_SIZE") {
            if let Ok(n) = v.parse() {
                self.stripe_size = Some(n);
            }
        }
        if let Ok(v) = env::var("FABRIC_STORE_SEMANTICS_ATOMICITY") {
            if let Some(parsed) = parse_atomicity(&v) {
                self.semantics.atomicity = Some(parsed);
            }
        }
        if let Ok(v) = env::var("FABRIC_STORE_SEMANTICS_CONCURRENCY") {
            if let Some(parsed) = parse_concurrency(&v) {
                self.semantics.concurrency = Some(parsed);
            }
        }
        if let Ok(v) = env::var("FABRIC_STORE_SEMANTICS_CONSISTENCY") {
            if let Some(parsed) = parse_consistency(&v) {
                self.semantics.consistency = Some(parsed);
            }
        }
        if let Ok(v) = env::var("FABRIC_STORE_SEMANTICS_SAFETY") {
            if let Some(parsed) = parse_safety(&v) {
                self.semantics.safety = Some(parsed);
            }
        }
        if let Ok(v) = env::var("FABRIC_STORE_SEMANTICS_ORDERING") {
            if let Some(parsed) = parse_ordering(&v) {
                self.semantics.ordering = Some(parsed);
            }
        }
        if let Ok(v) = env::var("FABRIC_STORE_SEMANTICS_PERSISTENCY") {
            if let Some(parsed) = parse_persistency(&v) {
                self.semantics.persistency = Some(parsed);
            }
        }
        self
    }

    pub fn build(self) -> CoreResult<Configuration> {
        let object_servers = parse_servers(self.object_servers.unwrap_or_default())?;
        let kv_servers = parse_servers(self.kv_servers.unwrap_or_default())?;
        let db_servers = parse_servers(self.db_servers.unwrap_or_default())?;
        let max_connections = self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let stripe_size = self.stripe_size.unwrap_or(DEFAULT_STRIPE_SIZE);

        if max_connections == 0 {
            return Err(CoreError::Config("max_connections must be > 0".into()));
        }
        if stripe_size == 0 {
            return Err(CoreError::Config("stripe_size must be > 0".into()));
        }
        if object_servers.is_empty() && kv_servers.is_empty() && db_servers.is_empty() {
            return Err(CoreError::Config(
                "at least one of servers.object/kv/db must be configured".into(),
            ));
        }

        let defaults = SemanticsTemplate::default();
        let semantics = self.semantics_override.unwrap_or(SemanticsTemplate {
            atomicity: self.semantics.atomicity.unwrap_or(defaults.atomicity),
            concurrency: self.semantics.concurrency.unwrap_or(defaults.concurrency),
            consistency: self.semantics.consistency.unwrap_or(defaults.consistency),
            safety: self.semantics.safety.unwrap_or(defaults.safety),
            ordering: self.semantics.ordering.unwrap_or(defaults.ordering),
            persistency: self.semantics.persistency.unwrap_or(defaults.persistency),
        });

        Ok(Configuration {
            object_servers,
            kv_servers,
            db_servers,
            max_connections,
            stripe_size,
            distribution: DistributionStrategy::round_robin(stripe_size),
            semantics,
        })
    }
}

fn parse_servers(specs: Vec<String>) -> CoreResult<Vec<ServerAddr>> {
    specs.iter().map(|s| ServerAddr::parse(s)).collect()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses one semantics dimension from the same lower-case, snake_case
/// spelling the `[semantics]` TOML table and `Deserialize` impls use
/// (e.g. `"operation"`, `"concurrency_none"` is written `"none"`). An
/// unrecognized value is ignored rather than rejected, matching
/// `with_env`'s existing tolerance of a malformed numeric env var.
fn parse_atomicity(value: &str) -> Option<crate::batch::Atomicity> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Some(crate::batch::Atomicity::None),
        "operation" => Some(crate::batch::Atomicity::Operation),
        "batch" => Some(crate::batch::Atomicity::Batch),
        _ => None,
    }
}

fn parse_concurrency(value: &str) -> Option<crate::batch::Concurrency> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Some(crate::batch::Concurrency::None),
        "session" => Some(crate::batch::Concurrency::Session),
        "strict" => Some(crate::batch::Concurrency::Strict),
        _ => None,
    }
}

fn parse_consistency(value: &str) -> Option<crate::batch::Consistency> {
    match value.trim().to_ascii_lowercase().as_str() {
        "immediate" => Some(crate::batch::Consistency::Immediate),
        "session" => Some(crate::batch::Consistency::Session),
        "eventual" => Some(crate::batch::Consistency::Eventual),
        _ => None,
    }
}

fn parse_safety(value: &str) -> Option<crate::batch::Safety> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Some(crate::batch::Safety::None),
        "network" => Some(crate::batch::Safety::Network),
        "storage" => Some(crate::batch::Safety::Storage),
        _ => None,
    }
}

fn parse_ordering(value: &str) -> Option<crate::batch::Ordering> {
    match value.trim().to_ascii_lowercase().as_str() {
        "strict" => Some(crate::batch::Ordering::Strict),
        "semi" => Some(crate::batch::Ordering::Semi),
        "none" => Some(crate::batch::Ordering::None),
        _ => None,
    }
}

fn parse_persistency(value: &str) -> Option<crate::batch::Persistency> {
    match value.trim().to_ascii_lowercase().as_str() {
        "immediate" => Some(crate::batch::Persistency::Immediate),
        "eventual" => Some(crate::batch::Persistency::Eventual),
        _ => None,
    }
}

/// Resolves `127.0.1.1` to `127.0.0.1` before connecting, matching a
/// long-documented workaround for distributions that map a machine's own
/// hostname to that address in `/etc/hosts` instead of to loopback proper.
pub fn normalize_loopback_alias(host: &str) -> &str {
    if host == "127.0.1.1" {
        "127.0.0.1"
    } else {
        host
    }
}

/// A simple namespace-qualified lookup table, used by the in-memory
/// backends in [`crate::backend`].
pub type Namespace = String;
pub type NamespacedMap<V> = HashMap<(Namespace, String), V>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_layer_is_overridden_by_explicit_builder_calls() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            max_connections = 3
            stripe_size = 1024

            [servers]
            object = ["10.0.0.1:9000"]
            "#
        )
        .unwrap();

        let config = ConfigurationBuilder::new()
            .with_file(file.path())
            .unwrap()
            .max_connections(9)
            .build()
            .unwrap();

        assert_eq!(config.object_servers, vec![ServerAddr::parse("10.0.0.1:9000").unwrap()]);
        assert_eq!(config.stripe_size, 1024);
        assert_eq!(config.max_connections, 9);
    }

    #[test]
    fn env_layer_overrides_file_but_not_explicit_builder_calls() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_connections = 3\n[servers]\nobject = [\"10.0.0.1:9000\"]").unwrap();

        std::env::set_var("FABRIC_STORE_MAX_CONNECTIONS", "7");
        let config = ConfigurationBuilder::new().with_file(file.path()).unwrap().with_env().build().unwrap();
        std::env::remove_var("FABRIC_STORE_MAX_CONNECTIONS");

        assert_eq!(config.max_connections, 7);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = ConfigurationBuilder::new()
            .with_file("/nonexistent/path/fabric-store.toml")
            .unwrap()
            .object_servers(vec!["127.0.0.1:1".to_string()])
            .build()
            .unwrap();
        assert_eq!(config.object_servers.len(), 1);
    }

    #[test]
    fn build_rejects_a_fleetless_configuration() {
        let err = ConfigurationBuilder::new().build().unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn build_rejects_zero_stripe_size() {
        let err = ConfigurationBuilder::new()
            .object_servers(vec!["127.0.0.1:1".to_string()])
            .stripe_size(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn semantics_file_section_is_layered_under_env_and_explicit_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [servers]
            object = ["127.0.0.1:1"]

            [semantics]
            atomicity = "batch"
            safety = "storage"
            "#
        )
        .unwrap();

        // File alone: both dimensions it names take effect, everything
        // else keeps the compiled-in default.
        let config = ConfigurationBuilder::new().with_file(file.path()).unwrap().build().unwrap();
        assert_eq!(config.semantics.atomicity, crate::batch::Atomicity::Batch);
        assert_eq!(config.semantics.safety, crate::batch::Safety::Storage);
        assert_eq!(config.semantics.consistency, SemanticsTemplate::default().consistency);

        // Env overrides the file's value for the same dimension.
        std::env::set_var("FABRIC_STORE_SEMANTICS_ATOMICITY", "none");
        let config = ConfigurationBuilder::new().with_file(file.path()).unwrap().with_env().build().unwrap();
        std::env::remove_var("FABRIC_STORE_SEMANTICS_ATOMICITY");
        assert_eq!(config.semantics.atomicity, crate::batch::Atomicity::None);
        assert_eq!(config.semantics.safety, crate::batch::Safety::Storage);

        // An explicit whole-template override wins over both.
        let explicit = SemanticsTemplate {
            atomicity: crate::batch::Atomicity::Operation,
            ..SemanticsTemplate::default()
        };
        let config = ConfigurationBuilder::new()
            .with_file(file.path())
            .unwrap()
            .semantics(explicit)
            .build()
            .unwrap();
        assert_eq!(config.semantics.atomicity, crate::batch::Atomicity::Operation);
        assert_eq!(config.semantics.safety, crate::batch::Safety::Network);
    }
}
