// ABOUTME: The persisted per-service record: desired spec, lifecycle status, attached resources.
// ABOUTME: Serialized as JSON; every field added later must default so old records still load.

use crate::types::{ContainerId, DatabaseId, ImageRef, NodeId, ServiceName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Absent,
    Provisioning,
    Building,
    Starting,
    Running,
    Failed,
    Terminating,
}

impl ServiceStatus {
    /// A reconciliation was under way when the record was last written.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Provisioning | Self::Building | Self::Starting | Self::Terminating
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "absent",
            Self::Provisioning => "provisioning",
            Self::Building => "building",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Terminating => "terminating",
        })
    }
}

/// Machine class a service's node is created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeClass {
    pub size: String,
    pub region: String,
    /// Provider base image, e.g. `docker-20-04`.
    pub image: String,
}

/// Database wanted by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseRequest {
    /// Create a managed cluster owned by the service.
    Create {
        engine: String,
        #[serde(default)]
        version: Option<String>,
        size: String,
        #[serde(default = "default_num_nodes")]
        num_nodes: u32,
    },
    /// Use an existing cluster; never deleted by terminate.
    Attach(DatabaseId),
}

fn default_num_nodes() -> u32 {
    1
}

/// How a freshly started container is judged ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    /// Time to let the container settle before the first check.
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,

    /// Command run inside the container; exit 0 means ready.
    #[serde(default)]
    pub cmd: Option<String>,
}

fn default_settle() -> Duration {
    Duration::from_secs(5)
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            settle: default_settle(),
            cmd: None,
        }
    }
}

/// Desired state of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Repository and tag to build as, or the prebuilt image when there is no context.
    pub image: ImageRef,
    #[serde(default)]
    pub context: Option<PathBuf>,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    pub node: NodeClass,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub database: Option<DatabaseRequest>,
    #[serde(default)]
    pub readiness: Readiness,
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

/// A node attached to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Booted and reachable when last checked.
    #[serde(default)]
    pub ready: bool,
}

/// A database attached to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRef {
    pub id: DatabaseId,
    pub name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Created for this service rather than attached.
    pub owned: bool,
}

impl DatabaseRef {
    pub fn is_online(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: ServiceName,
    pub status: ServiceStatus,
    pub spec: ServiceSpec,
    #[serde(default)]
    pub nodes: Vec<NodeRef>,
    #[serde(default)]
    pub database: Option<DatabaseRef>,
    /// Image the running container was started from.
    #[serde(default)]
    pub image: Option<ImageRef>,
    /// Image before the last redeploy; the rollback target.
    #[serde(default)]
    pub previous_image: Option<ImageRef>,
    #[serde(default)]
    pub container: Option<ContainerId>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Set while a redeploy is replacing a running container.
    #[serde(default)]
    pub rollback: Option<RollbackPoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The running state a redeploy replaces, kept on the record until the
/// redeploy finishes or is rolled back, so an interrupted one can still be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub spec: ServiceSpec,
    #[serde(default)]
    pub image: Option<ImageRef>,
    #[serde(default)]
    pub previous_image: Option<ImageRef>,
    #[serde(default)]
    pub container: Option<ContainerId>,
}

impl RollbackPoint {
    pub fn of(record: &ServiceRecord) -> Self {
        Self {
            spec: record.spec.clone(),
            image: record.image.clone(),
            previous_image: record.previous_image.clone(),
            container: record.container.clone(),
        }
    }

    /// Put the replaced state back on `record`.
    pub fn restore(self, record: &mut ServiceRecord) {
        record.spec = self.spec;
        record.image = self.image;
        record.previous_image = self.previous_image;
        record.container = self.container;
    }
}

impl ServiceRecord {
    pub fn new(name: ServiceName, spec: ServiceSpec) -> Self {
        let now = Utc::now();
        Self {
            name,
            status: ServiceStatus::Absent,
            spec,
            nodes: Vec::new(),
            database: None,
            image: None,
            previous_image: None,
            container: None,
            last_error: None,
            warnings: Vec::new(),
            rollback: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The node the service's container runs on.
    pub fn node(&self) -> Option<&NodeRef> {
        self.nodes.first()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn references_node(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }

    pub fn references_database(&self, id: &DatabaseId) -> bool {
        self.database.as_ref().is_some_and(|d| &d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> ServiceSpec {
        ServiceSpec {
            image: ImageRef::parse("registry.example.com/acme/web:v1").unwrap(),
            context: Some(PathBuf::from("./web")),
            dockerfile: default_dockerfile(),
            node: NodeClass {
                size: "s-1vcpu-1gb".to_string(),
                region: "ams3".to_string(),
                image: "docker-20-04".to_string(),
            },
            ports: vec!["80:8080".to_string()],
            env: BTreeMap::from([("RUST_LOG".to_string(), "info".to_string())]),
            volumes: vec![],
            database: None,
            readiness: Readiness::default(),
        }
    }

    #[test]
    fn in_flight_statuses() {
        assert!(ServiceStatus::Provisioning.is_in_flight());
        assert!(ServiceStatus::Terminating.is_in_flight());
        assert!(!ServiceStatus::Running.is_in_flight());
        assert!(!ServiceStatus::Failed.is_in_flight());
        assert!(!ServiceStatus::Absent.is_in_flight());
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut record = ServiceRecord::new(ServiceName::new("web").unwrap(), sample_spec());
        record.status = ServiceStatus::Running;
        record.nodes.push(NodeRef {
            id: NodeId::new("3164494"),
            name: "web".to_string(),
            ip_address: Some("203.0.113.7".to_string()),
            ready: true,
        });
        record.image = Some(ImageRef::parse("registry.example.com/acme/web:v1@sha256:abc").unwrap());

        let json = serde_json::to_string_pretty(&record).unwrap();
        assert!(json.contains("\"status\": \"running\""));
        let back: ServiceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn database_request_parses_both_forms() {
        let create: DatabaseRequest =
            serde_yaml::from_str("create:\n  engine: pg\n  size: db-s-1vcpu-1gb\n").unwrap();
        assert_eq!(
            create,
            DatabaseRequest::Create {
                engine: "pg".to_string(),
                version: None,
                size: "db-s-1vcpu-1gb".to_string(),
                num_nodes: 1,
            }
        );

        let attach: DatabaseRequest = serde_yaml::from_str("attach: 9cc10173").unwrap();
        assert_eq!(attach, DatabaseRequest::Attach(DatabaseId::new("9cc10173")));
    }

    #[test]
    fn references_are_matched_by_id() {
        let mut record = ServiceRecord::new(ServiceName::new("api").unwrap(), sample_spec());
        record.database = Some(DatabaseRef {
            id: DatabaseId::new("db-1"),
            name: "api-db".to_string(),
            endpoint: None,
            owned: true,
        });
        assert!(record.references_database(&DatabaseId::new("db-1")));
        assert!(!record.references_database(&DatabaseId::new("db-2")));
        assert!(!record.references_node(&NodeId::new("1")));
    }

    #[test]
    fn rollback_point_restores_replaced_state() {
        let mut record = ServiceRecord::new(ServiceName::new("web").unwrap(), sample_spec());
        record.image = Some(ImageRef::parse("registry.example.com/acme/web:v1@sha256:aa").unwrap());
        record.container = Some(ContainerId::new("c0ffee0001"));
        let point = RollbackPoint::of(&record);

        record.spec.ports.push("443:8443".to_string());
        record.previous_image = record.image.take();
        record.image = Some(ImageRef::parse("registry.example.com/acme/web:v1@sha256:bb").unwrap());
        record.container = Some(ContainerId::new("c0ffee0002"));
        point.restore(&mut record);

        assert_eq!(record.spec, sample_spec());
        assert_eq!(record.container, Some(ContainerId::new("c0ffee0001")));
        assert!(record.previous_image.is_none());
        assert!(record.image.as_ref().unwrap().to_string().ends_with("sha256:aa"));
    }

    #[test]
    fn records_without_rollback_point_still_load() {
        let record = ServiceRecord::new(ServiceName::new("web").unwrap(), sample_spec());
        let mut json = serde_json::to_value(&record).unwrap();
        json.as_object_mut().unwrap().remove("rollback");
        let back: ServiceRecord = serde_json::from_value(json).unwrap();
        assert!(back.rollback.is_none());
    }
}
