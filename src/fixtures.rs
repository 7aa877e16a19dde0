//! Helper methods only available for tests
use std::sync::Arc;

use http::{Request, Response};
use hyper::Body;
use k8s_openapi::ByteString;
use kube::{runtime::reflector, Client, Resource, ResourceExt};
use tokio::sync::RwLock;

use crate::{
    operator::{Context, Diagnostics},
    queue::WorkQueue,
    resources::{Mk, MkSpec},
    Metrics,
};

impl Mk {
    /// An Mk resource with a representative spec
    pub fn test(name: &str, namespace: &str) -> Self {
        let mut mk = Mk::new(
            name,
            MkSpec {
                mongo_express_image: "mongo-express:1".into(),
                mongo_express_service_port: "8081".into(),
                mongo_db_image: "mongo:6".into(),
                db_username: "admin".into(),
                db_password: "secret".into(),
            },
        );
        mk.meta_mut().namespace = Some(namespace.into());
        mk
    }

    pub fn with_db_image(mut self, image: &str) -> Self {
        self.spec.mongo_db_image = image.into();
        self
    }
}

impl Context {
    /// A Context wired to a mock apiserver and an empty cache
    pub fn test() -> (Arc<Self>, ApiServerVerifier, reflector::store::Writer<Mk>) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let (store, writer) = reflector::store();
        let ctx = Context {
            client,
            store,
            queue: Arc::new(WorkQueue::new()),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Metrics::default(),
        };
        (Arc::new(ctx), ApiServerVerifier(handle), writer)
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we want to test for in the mock apiserver
pub enum Scenario {
    /// The five child creates arrive in order and succeed
    ChildCreates(Mk),
    /// The credential create is rejected; the remaining creates still arrive
    SecretCreateFails(Mk),
    /// No api calls are expected
    RadioSilence,
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

const ALREADY_EXISTS: &str = r#"{
  "kind": "Status",
  "apiVersion": "v1",
  "metadata": {},
  "status": "Failure",
  "message": "secrets \"mongodb-secret\" already exists",
  "reason": "AlreadyExists",
  "code": 409
}"#;

impl ApiServerVerifier {
    /// Drive the scenario to completion on a background task.
    ///
    /// Every create the engine issues is received here in order, verified
    /// against the resource the scenario was built from, and answered by
    /// echoing the posted object (the apiserver's success shape).
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::ChildCreates(mk) => self.handle_child_creates(mk, false).await,
                Scenario::SecretCreateFails(mk) => self.handle_child_creates(mk, true).await,
                Scenario::RadioSilence => (),
            }
        })
    }

    async fn handle_child_creates(mut self, mk: Mk, fail_secret: bool) {
        let namespace = mk.namespace().unwrap();
        let name = mk.name_any();
        let expected = [
            (format!("/api/v1/namespaces/{namespace}/secrets?"), "mongodb-secret".to_string()),
            (
                format!("/apis/apps/v1/namespaces/{namespace}/deployments?"),
                format!("{name}-deployment"),
            ),
            (format!("/api/v1/namespaces/{namespace}/services?"), "mongodb-service".to_string()),
            (
                format!("/apis/apps/v1/namespaces/{namespace}/deployments?"),
                format!("{name}-express-deployment"),
            ),
            (
                format!("/api/v1/namespaces/{namespace}/services?"),
                "mongoexpress-service".to_string(),
            ),
        ];

        for (idx, (path, object_name)) in expected.iter().enumerate() {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::POST);
            assert_eq!(&request.uri().to_string(), path);

            let request_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
            let json: serde_json::Value =
                serde_json::from_slice(&request_body).expect("valid object");
            assert_eq!(json["metadata"]["name"], object_name.as_str());
            self.verify_object(idx, &mk, &name, &json);

            if fail_secret && idx == 0 {
                send.send_response(
                    Response::builder()
                        .status(409)
                        .body(Body::from(ALREADY_EXISTS))
                        .unwrap(),
                );
            } else {
                send.send_response(Response::builder().body(Body::from(request_body)).unwrap());
            }
        }
    }

    fn verify_object(&self, idx: usize, mk: &Mk, name: &str, json: &serde_json::Value) {
        let b64 = |s: &str| serde_json::to_value(ByteString(s.as_bytes().to_vec())).unwrap();
        match idx {
            // credentials secret
            0 => {
                assert_eq!(json["data"]["username"], b64(&mk.spec.db_username));
                assert_eq!(json["data"]["password"], b64(&mk.spec.db_password));
            }
            // mongodb deployment
            1 => {
                assert_eq!(json["spec"]["replicas"], 2);
                let labels = &json["spec"]["template"]["metadata"]["labels"];
                assert_eq!(labels["app"], format!("{name}db"));
                assert_eq!(json["spec"]["selector"]["matchLabels"], *labels);
                let container = &json["spec"]["template"]["spec"]["containers"][0];
                assert_eq!(container["image"], mk.spec.mongo_db_image);
                assert_eq!(container["ports"][0]["containerPort"], 27017);
                assert_eq!(
                    container["env"][0]["valueFrom"]["secretKeyRef"]["name"],
                    "mongodb-secret"
                );
            }
            // mongodb service
            2 => {
                assert_eq!(json["spec"]["type"], "ClusterIP");
                assert_eq!(json["spec"]["selector"]["app"], format!("{name}db"));
                assert_eq!(json["spec"]["ports"][0]["port"], 27017);
            }
            // mongo-express deployment
            3 => {
                assert_eq!(json["spec"]["replicas"], 2);
                let labels = &json["spec"]["template"]["metadata"]["labels"];
                assert_eq!(labels["app"], format!("{name}express"));
                let container = &json["spec"]["template"]["spec"]["containers"][0];
                assert_eq!(container["image"], mk.spec.mongo_express_image);
                assert_eq!(container["ports"][0]["containerPort"], 8081);
                let env = container["env"].as_array().unwrap();
                let server = env
                    .iter()
                    .find(|e| e["name"] == "ME_CONFIG_MONGODB_SERVER")
                    .expect("server env var");
                assert_eq!(server["value"], "mongodb-service");
            }
            // mongo-express service
            4 => {
                assert_eq!(json["spec"]["type"], "LoadBalancer");
                assert_eq!(json["spec"]["selector"]["app"], format!("{name}express"));
                assert_eq!(json["spec"]["ports"][0]["port"], 8081);
                assert_eq!(json["spec"]["ports"][0]["nodePort"], 31000);
            }
            _ => unreachable!("unexpected request"),
        }
    }
}
