//! Builds the child objects derived from an [`Mk`] resource.
//!
//! Everything here is a pure function of the resource's spec, name and
//! namespace: the same inputs always produce the same set of objects, and no
//! cluster state is consulted.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, Secret,
            SecretKeySelector, Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
    ByteString,
};
use kube::{core::ObjectMeta, ResourceExt};

use crate::resources::Mk;

/// Fixed name of the credentials secret, shared by every Mk in a namespace.
pub const SECRET_NAME: &str = "mongodb-secret";
/// Fixed name of the cluster-internal mongodb service.
pub const DB_SERVICE_NAME: &str = "mongodb-service";
/// Fixed name of the externally reachable mongo-express service.
pub const EXPRESS_SERVICE_NAME: &str = "mongoexpress-service";

const SECRET_USERNAME_KEY: &str = "username";
const SECRET_PASSWORD_KEY: &str = "password";
const DB_PORT: i32 = 27017;
const EXPRESS_PORT: i32 = 8081;
const EXPRESS_NODE_PORT: i32 = 31000;
const REPLICAS: i32 = 2;

/// The five objects materialized for one Mk resource.
#[derive(Debug, Clone)]
pub struct Children {
    pub secret: Secret,
    pub db_deployment: Deployment,
    pub db_service: Service,
    pub express_deployment: Deployment,
    pub express_service: Service,
}

/// Shape of one exposed service before it becomes a full `Service` object.
struct ServiceBlueprint {
    name: &'static str,
    selector: BTreeMap<String, String>,
    service_type: &'static str,
    port: i32,
    node_port: Option<i32>,
}

/// Compute the desired children for an Mk resource.
///
/// The service selectors are copied from the corresponding deployment's
/// labels; keeping those in lockstep is what makes each service actually
/// route to its pods.
pub fn synthesize(mk: &Mk) -> Children {
    let name = mk.name_any();
    let namespace = mk.namespace().unwrap_or_default();

    let secret = build_secret(mk, &namespace);
    let db_deployment = build_db_deployment(mk, &name, &namespace);
    let db_service = build_service(ServiceBlueprint {
        name: DB_SERVICE_NAME,
        selector: db_deployment.metadata.labels.clone().unwrap_or_default(),
        service_type: "ClusterIP",
        port: DB_PORT,
        node_port: None,
    });
    let express_deployment = build_express_deployment(mk, &name, &namespace);
    let express_service = build_service(ServiceBlueprint {
        name: EXPRESS_SERVICE_NAME,
        selector: express_deployment.metadata.labels.clone().unwrap_or_default(),
        service_type: "LoadBalancer",
        port: EXPRESS_PORT,
        node_port: Some(EXPRESS_NODE_PORT),
    });

    Children {
        secret,
        db_deployment,
        db_service,
        express_deployment,
        express_service,
    }
}

fn build_secret(mk: &Mk, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(SECRET_NAME.into()),
            namespace: Some(namespace.into()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (
                SECRET_USERNAME_KEY.into(),
                ByteString(mk.spec.db_username.clone().into_bytes()),
            ),
            (
                SECRET_PASSWORD_KEY.into(),
                ByteString(mk.spec.db_password.clone().into_bytes()),
            ),
        ])),
        ..Default::default()
    }
}

fn build_db_deployment(mk: &Mk, name: &str, namespace: &str) -> Deployment {
    let labels = BTreeMap::from([("app".to_string(), format!("{name}db"))]);
    let container = Container {
        name: format!("{name}-container"),
        image: Some(mk.spec.mongo_db_image.clone()),
        ports: Some(vec![ContainerPort {
            container_port: DB_PORT,
            ..Default::default()
        }]),
        env: Some(vec![
            secret_env("MONGO_INITDB_ROOT_USERNAME", SECRET_USERNAME_KEY),
            secret_env("MONGO_INITDB_ROOT_PASSWORD", SECRET_PASSWORD_KEY),
        ]),
        ..Default::default()
    };

    deployment(format!("{name}-deployment"), namespace, labels, container)
}

fn build_express_deployment(mk: &Mk, name: &str, namespace: &str) -> Deployment {
    let labels = BTreeMap::from([("app".to_string(), format!("{name}express"))]);
    let container = Container {
        name: format!("{name}-express-container"),
        image: Some(mk.spec.mongo_express_image.clone()),
        ports: Some(vec![ContainerPort {
            container_port: EXPRESS_PORT,
            ..Default::default()
        }]),
        env: Some(vec![
            secret_env("ME_CONFIG_MONGODB_ADMINUSERNAME", SECRET_USERNAME_KEY),
            secret_env("ME_CONFIG_MONGODB_ADMINPASSWORD", SECRET_PASSWORD_KEY),
            // The admin UI reaches mongodb through its stable service name
            EnvVar {
                name: "ME_CONFIG_MONGODB_SERVER".into(),
                value: Some(DB_SERVICE_NAME.into()),
                value_from: None,
            },
        ]),
        ..Default::default()
    };

    deployment(
        format!("{name}-express-deployment"),
        namespace,
        labels,
        container,
    )
}

fn deployment(
    name: String,
    namespace: &str,
    labels: BTreeMap<String, String>,
    container: Container,
) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.into()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(REPLICAS),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// An env var whose value is pulled from the credentials secret by key.
fn secret_env(name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(SECRET_NAME.into()),
                key: key.into(),
                optional: None,
            }),
            ..Default::default()
        }),
        value: None,
    }
}

fn build_service(blueprint: ServiceBlueprint) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(blueprint.name.into()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(blueprint.service_type.into()),
            selector: Some(blueprint.selector),
            ports: Some(vec![ServicePort {
                port: blueprint.port,
                node_port: blueprint.node_port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}
