use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a managed MongoDB instance with a mongo-express admin UI
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "Mk",
    group = "mongokube.wrd",
    version = "beta1",
    status = "MkStatus",
    doc = "A MongoDB deployment paired with a mongo-express admin UI",
    namespaced,
    printcolumn = r#"{ "name": "mongoImage", "type": "string", "description": "mongodb container image", "jsonPath": ".spec.mongoDbImage" }"#,
    printcolumn = r#"{ "name": "expressImage", "type": "string", "description": "mongo-express container image", "jsonPath": ".spec.mongoExpressImage" }"#,
    printcolumn = r#"{ "name": "progress", "type": "string", "description": "reconciliation progress", "jsonPath": ".status.progress" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct MkSpec {
    /// Container image for the mongo-express admin UI.
    pub mongo_express_image: String,

    /// Port the admin UI should be reachable on.
    ///
    /// Carried on the wire for compatibility; the express service currently
    /// always exposes 8081 with node port 31000.
    pub mongo_express_service_port: String,

    /// Container image for the mongodb workload.
    pub mongo_db_image: String,

    /// Root username for the database, injected into both workloads through
    /// the derived credentials secret.
    pub db_username: String,

    /// Root password for the database. Only ever referenced indirectly by
    /// secret key, never copied into child objects or logs.
    pub db_password: String,
}

/// The status of an Mk instance
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
pub struct MkStatus {
    /// Free-text progress indicator
    pub progress: String,
}
