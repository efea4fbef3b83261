use crate::config::{BatchConfig, ResolverConfig, ShopifyConfig, TransportConfig, UploaderConfig};
use crate::http::build_client;
use crate::shopify::ShopifyClient;
use crate::transport::TransportGovernor;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use wiremock::matchers::{body_string_contains, method};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub struct MockCatalog {
    pub server: MockServer,
}

impl MockCatalog {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn config(&self) -> UploaderConfig {
        config_for(&self.server.uri())
    }

    pub fn client(&self) -> ShopifyClient {
        client_for(&self.config())
    }

    /// Mounts the stateful fakes most coordinator tests need.
    pub async fn with_fakes(self) -> Self {
        Mock::given(method("POST"))
            .and(body_string_contains("HermesFileCreate"))
            .respond_with(FileCreateEcho::default())
            .mount(&self.server)
            .await;
        MetafieldStore::default().mount(&self.server).await;
        self
    }

    pub async fn requests_containing(&self, needle: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| String::from_utf8_lossy(&request.body).contains(needle))
            .count()
    }
}

pub fn config_for(base_url: &str) -> UploaderConfig {
    UploaderConfig {
        shop: ShopifyConfig {
            shop_domain: "hermes-test.myshopify.com".into(),
            access_token: "shpat_test".into(),
            api_base_url: Some(base_url.to_string()),
            ..ShopifyConfig::default()
        },
        transport: TransportConfig {
            requests_per_second: 200,
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            backoff_multiplier: 2.0,
            jitter_ms: 0,
            call_timeout_secs: 5,
            connect_timeout_secs: 1,
        },
        batch: BatchConfig {
            inter_chunk_delay_ms: 0,
            ..BatchConfig::default()
        },
        resolver: ResolverConfig {
            requery_delay_ms: 10,
            probe_timeout_secs: 2,
            ..ResolverConfig::default()
        },
        ..UploaderConfig::default()
    }
}

pub fn client_for(config: &UploaderConfig) -> ShopifyClient {
    ShopifyClient::new(
        build_client(&config.transport),
        TransportGovernor::new(&config.transport),
        config.shop.clone(),
    )
}

pub fn graphql_ok(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
}

pub fn file_node(id: &str, alt: Option<&str>, status: &str) -> Value {
    json!({
        "id": id,
        "fileStatus": status,
        "alt": alt,
        "createdAt": "2024-05-01T10:00:00Z",
        "fileErrors": []
    })
}

pub fn staged_target_response(uri: &str) -> Value {
    json!({
        "stagedUploadsCreate": {
            "stagedTargets": [{
                "url": format!("{uri}/upload"),
                "resourceUrl": "https://shopify-staged-uploads.storage.example.com/tmp/front.png",
                "parameters": [
                    { "name": "key", "value": "tmp/front.png" },
                    { "name": "Content-Type", "value": "image/png" },
                    { "name": "policy", "value": "cG9saWN5" },
                    { "name": "x-goog-signature", "value": "abc123" }
                ]
            }],
            "userErrors": []
        }
    })
}

fn variables(request: &Request) -> (String, Value) {
    let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
    let query = body["query"].as_str().unwrap_or_default().to_string();
    (query, body["variables"].clone())
}

/// `fileCreate` fake: one new file per input, echoing alt text. Sources on an
/// `.invalid` host come back as field-level user errors.
#[derive(Default)]
pub struct FileCreateEcho {
    next: AtomicUsize,
}

impl Respond for FileCreateEcho {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let (_, variables) = variables(request);
        let inputs = variables["files"].as_array().cloned().unwrap_or_default();
        let mut files = Vec::new();
        let mut errors = Vec::new();
        for (idx, input) in inputs.iter().enumerate() {
            let source = input["originalSource"].as_str().unwrap_or_default();
            if source.contains(".invalid") {
                errors.push(json!({
                    "field": ["files", idx.to_string(), "originalSource"],
                    "message": "Image could not be downloaded",
                    "code": "INVALID"
                }));
                continue;
            }
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            files.push(file_node(
                &format!("gid://shopify/MediaImage/{n}"),
                input["alt"].as_str(),
                "UPLOADED",
            ));
        }
        graphql_ok(json!({ "fileCreate": { "files": files, "userErrors": errors } }))
    }
}

#[derive(Default)]
struct StoreState {
    current: HashMap<(String, String, String), (String, String)>,
    /// Every value ever written; search answers from this to mimic index lag.
    history: Vec<(String, String, String, String)>,
}

/// In-memory metafield backend covering set, read-back and search.
#[derive(Clone, Default)]
pub struct MetafieldStore {
    state: Arc<Mutex<StoreState>>,
    reject_writes: bool,
}

impl MetafieldStore {
    pub fn rejecting_writes() -> Self {
        Self {
            reject_writes: true,
            ..Self::default()
        }
    }

    pub async fn mount(&self, server: &MockServer) {
        Mock::given(method("POST"))
            .and(body_string_contains("Metafield"))
            .respond_with(self.clone())
            .mount(server)
            .await;
    }

    fn set(&self, variables: &Value) -> Value {
        if self.reject_writes {
            return json!({ "metafieldsSet": {
                "metafields": null,
                "userErrors": [{
                    "field": ["metafields", "0", "value"],
                    "message": "Value is invalid",
                    "code": "INVALID_VALUE"
                }]
            }});
        }
        let mut state = self.state.lock().expect("store lock");
        let inputs = variables["metafields"].as_array().cloned().unwrap_or_default();
        let mut written = Vec::new();
        for input in inputs {
            let field = |name: &str| input[name].as_str().unwrap_or_default().to_string();
            let (owner, namespace, key, value, value_type) = (
                field("ownerId"),
                field("namespace"),
                field("key"),
                field("value"),
                field("type"),
            );
            state.history.push((owner.clone(), namespace.clone(), key.clone(), value.clone()));
            state.current.insert(
                (owner, namespace.clone(), key.clone()),
                (value.clone(), value_type.clone()),
            );
            written.push(json!({ "namespace": namespace, "key": key, "value": value, "type": value_type }));
        }
        json!({ "metafieldsSet": { "metafields": written, "userErrors": [] } })
    }

    fn read(&self, variables: &Value) -> Value {
        let state = self.state.lock().expect("store lock");
        let owner = variables["id"].as_str().unwrap_or_default();
        let namespace = variables["namespace"].as_str();
        let mut nodes: Vec<Value> = state
            .current
            .iter()
            .filter(|((file, ns, _), _)| file == owner && namespace.is_none_or(|wanted| wanted == ns))
            .map(|((_, ns, key), (value, value_type))| {
                json!({ "namespace": ns, "key": key, "value": value, "type": value_type })
            })
            .collect();
        nodes.sort_by(|a, b| a["key"].as_str().cmp(&b["key"].as_str()));
        json!({ "node": { "metafields": { "nodes": nodes } } })
    }

    fn search(&self, variables: &Value) -> Value {
        let state = self.state.lock().expect("store lock");
        let query = variables["query"].as_str().unwrap_or_default();
        let (path, raw_value) = query
            .trim_start_matches("metafields.")
            .split_once(':')
            .unwrap_or_default();
        let (namespace, key) = path.split_once('.').unwrap_or_default();
        let value = raw_value
            .trim_matches('"')
            .replace("\\\"", "\"")
            .replace("\\\\", "\\");
        let mut owners: Vec<&str> = Vec::new();
        for (owner, ns, k, v) in &state.history {
            if ns == namespace && k == key && *v == value && !owners.contains(&owner.as_str()) {
                owners.push(owner);
            }
        }
        let nodes: Vec<Value> = owners.into_iter().map(|id| json!({ "id": id })).collect();
        json!({ "files": {
            "nodes": nodes,
            "pageInfo": { "hasNextPage": false, "endCursor": null }
        }})
    }
}

impl Respond for MetafieldStore {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let (query, variables) = variables(request);
        let data = if query.contains("HermesMetafieldsSet") {
            self.set(&variables)
        } else if query.contains("HermesFileMetafields") {
            self.read(&variables)
        } else {
            self.search(&variables)
        };
        graphql_ok(data)
    }
}
