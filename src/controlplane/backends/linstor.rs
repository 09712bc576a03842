//! LINSTOR Controller Adapter
//!
//! Talks to the LINSTOR controller REST API. [`LinstorClient`] implements the
//! storage side; [`LinstorConfigStore`] keeps promoter configurations in the
//! controller's key-value store, where the HA daemon on every node picks them
//! up, and toggles management through resource-definition properties.

use crate::domain::model::VolumeConfig;
use crate::domain::ports::{
    DeployedState, Deployment, DiskState, HaConfigStore, Resource, ResourceDefinition,
    ResourceGroup, ResourceSpec, ResourceVolume, StorageClient, StoredConfig, VolumeDefinition,
};
use crate::error::{Error, Result, ResultExt};
use crate::promoter::{config_path, PromoterConfig, CONFIG_DIR};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default controller endpoint
pub const DEFAULT_CONTROLLER: &str = "http://localhost:3370";

/// Key-value store instance holding promoter configurations
pub const KV_INSTANCE: &str = "linstor-gateway";

const GROSS_SIZE_FLAG: &str = "GROSS_SIZE";
const DISKLESS_FLAG: &str = "DISKLESS";

const FILE_ENABLED: &str = "True";
const FILE_DISABLED: &str = "False";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the LINSTOR adapter
#[derive(Debug, Clone)]
pub struct LinstorConfig {
    /// Controller URLs, tried in order
    pub controllers: Vec<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for LinstorConfig {
    fn default() -> Self {
        Self {
            controllers: vec![DEFAULT_CONTROLLER.to_string()],
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl LinstorConfig {
    /// Parse a comma separated controller list as accepted by `LS_CONTROLLERS`
    pub fn from_controller_list(list: &str) -> Self {
        let controllers: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(normalize_controller)
            .collect();
        if controllers.is_empty() {
            return Self::default();
        }
        Self {
            controllers,
            ..Self::default()
        }
    }
}

/// Add the scheme and the default port where missing
fn normalize_controller(raw: &str) -> String {
    let (scheme, host) = match raw.split_once("://") {
        Some((scheme, host)) => (scheme, host),
        None => ("http", raw),
    };
    let host = host.trim_end_matches('/');
    let has_port = host
        .rsplit_once(':')
        .map(|(_, port)| port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if has_port {
        format!("{}://{}", scheme, host)
    } else {
        format!("{}://{}:3370", scheme, host)
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiCallRc {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RscDfn {
    name: String,
    #[serde(default)]
    resource_group_name: String,
    #[serde(default)]
    props: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VlmDfn {
    volume_number: u32,
    size_kib: u64,
    #[serde(default)]
    flags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SelectFilter {
    place_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RscGrp {
    name: String,
    #[serde(default)]
    select_filter: SelectFilter,
}

#[derive(Debug, Default, Deserialize)]
struct RscState {
    in_use: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct VlmState {
    #[serde(default)]
    disk_state: DiskState,
}

#[derive(Debug, Deserialize)]
struct Vlm {
    volume_number: u32,
    device_path: Option<String>,
    #[serde(default)]
    state: VlmState,
}

#[derive(Debug, Deserialize)]
struct Rsc {
    name: String,
    node_name: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    state: RscState,
    #[serde(default)]
    volumes: Vec<Vlm>,
}

#[derive(Debug, Deserialize)]
struct KvStore {
    #[serde(default)]
    props: BTreeMap<String, String>,
}

impl From<RscDfn> for ResourceDefinition {
    fn from(rd: RscDfn) -> Self {
        Self {
            name: rd.name,
            resource_group: rd.resource_group_name,
            props: rd.props,
        }
    }
}

impl From<VlmDfn> for VolumeDefinition {
    fn from(vd: VlmDfn) -> Self {
        Self {
            number: vd.volume_number,
            size_kib: vd.size_kib,
            gross: vd.flags.iter().any(|f| f == GROSS_SIZE_FLAG),
        }
    }
}

impl From<RscGrp> for ResourceGroup {
    fn from(rg: RscGrp) -> Self {
        Self {
            name: rg.name,
            place_count: rg.select_filter.place_count,
        }
    }
}

impl From<Rsc> for Resource {
    fn from(r: Rsc) -> Self {
        let diskless = r.flags.iter().any(|f| f == DISKLESS_FLAG);
        Self {
            name: r.name,
            node_name: r.node_name,
            in_use: r.state.in_use,
            diskless,
            volumes: r
                .volumes
                .into_iter()
                .map(|v| ResourceVolume {
                    number: v.volume_number,
                    device_path: v.device_path,
                    disk_state: v.state.disk_state,
                })
                .collect(),
        }
    }
}

// =============================================================================
// LINSTOR Client
// =============================================================================

/// REST client for the LINSTOR controller
#[derive(Debug, Clone)]
pub struct LinstorClient {
    http: reqwest::Client,
    base_url: String,
}

impl LinstorClient {
    /// Client bound to a single controller, without probing it
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Connect to the first controller that answers
    pub async fn connect(config: &LinstorConfig) -> Result<Self> {
        for controller in &config.controllers {
            let client = Self::new(controller.clone(), config.request_timeout)?;
            match client.call(Method::GET, "/v1/controller/version", None).await {
                Ok(_) => {
                    info!("Using LINSTOR controller at {}", controller);
                    return Ok(client);
                }
                Err(e) => warn!("LINSTOR controller {} unreachable: {}", controller, e),
            }
        }
        Err(Error::NoController(config.controllers.join(",")))
    }

    async fn call(&self, method: Method, path: &str, body: Option<serde_json::Value>) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::not_found("linstor-object", path));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::ControllerApi {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                message: api_message(&text),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(self.call(Method::GET, path, None).await?.json().await?)
    }

    async fn send(&self, method: Method, path: &str, body: serde_json::Value) -> Result<()> {
        self.call(method, path, Some(body)).await.map(|_| ())
    }

    async fn resource_definition(&self, name: &str) -> Result<Option<ResourceDefinition>> {
        match self
            .get_json::<RscDfn>(&format!("/v1/resource-definitions/{}", encode(name)))
            .await
        {
            Ok(rd) => Ok(Some(rd.into())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn resource_group(&self, name: &str) -> Result<Option<ResourceGroup>> {
        match self
            .get_json::<RscGrp>(&format!("/v1/resource-groups/{}", encode(name)))
            .await
        {
            Ok(rg) => Ok(Some(rg.into())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn volume_definitions(&self, name: &str) -> Result<Vec<VolumeDefinition>> {
        let vds: Vec<VlmDfn> = self
            .get_json(&format!("/v1/resource-definitions/{}/volume-definitions", encode(name)))
            .await?;
        Ok(vds.into_iter().map(Into::into).collect())
    }

    async fn create_volume_definition(&self, name: &str, volume: &VolumeConfig, gross: bool) -> Result<()> {
        info!("Creating volume definition {}/{}", name, volume.number);
        let flags: Vec<&str> = if gross { vec![GROSS_SIZE_FLAG] } else { vec![] };
        self.send(
            Method::POST,
            &format!("/v1/resource-definitions/{}/volume-definitions", encode(name)),
            json!({
                "volume_definition": {
                    "volume_number": volume.number,
                    "size_kib": volume.size_kib,
                    "flags": flags,
                }
            }),
        )
        .await
    }

    /// Set or remove properties of a resource definition
    async fn modify_resource_definition(
        &self,
        name: &str,
        override_props: BTreeMap<String, String>,
        delete_props: Vec<String>,
    ) -> Result<()> {
        self.send(
            Method::PUT,
            &format!("/v1/resource-definitions/{}", encode(name)),
            json!({ "override_props": override_props, "delete_props": delete_props }),
        )
        .await
    }

    async fn kv_props(&self) -> Result<BTreeMap<String, String>> {
        match self
            .get_json::<Vec<KvStore>>(&format!("/v1/key-value-store/{}", KV_INSTANCE))
            .await
        {
            Ok(stores) => Ok(stores.into_iter().flat_map(|s| s.props).collect()),
            Err(e) if e.is_not_found() => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    async fn modify_kv(&self, override_props: BTreeMap<String, String>, delete_props: Vec<String>) -> Result<()> {
        self.send(
            Method::PUT,
            &format!("/v1/key-value-store/{}", KV_INSTANCE),
            json!({ "override_props": override_props, "delete_props": delete_props }),
        )
        .await
    }
}

#[async_trait]
impl StorageClient for LinstorClient {
    async fn ensure_resource(&self, spec: &ResourceSpec, allow_extend: bool) -> Result<Deployment> {
        let group = self
            .resource_group(&spec.resource_group)
            .await?
            .ok_or_else(|| Error::not_found("resource-group", &spec.resource_group))?;

        let missing: Vec<&VolumeConfig> = match self.resource_definition(&spec.name).await? {
            Some(rd) => {
                let existing = self.volume_definitions(&spec.name).await?;
                let missing = spec.missing_volumes(&existing, allow_extend)?;
                let changed = spec.changed_props(&rd.props);
                if !changed.is_empty() {
                    debug!("Updating {} properties of {}", changed.len(), spec.name);
                    self.modify_resource_definition(&spec.name, changed, Vec::new())
                        .await
                        .context(format!("failed to update resource definition {}", spec.name))?;
                }
                missing
            }
            None => {
                info!("Creating resource definition {}", spec.name);
                self.send(Method::POST, "/v1/resource-definitions", resource_definition_body(spec))
                    .await
                    .context(format!("failed to create resource definition {}", spec.name))?;
                spec.volumes.iter().collect()
            }
        };

        for vol in missing {
            let gross = spec.gross_size && vol.number != 0;
            self.create_volume_definition(&spec.name, vol, gross)
                .await
                .context(format!("failed to create volume {}/{}", spec.name, vol.number))?;
        }

        let mut resources = self.resources(&spec.name).await?;
        if resources.is_empty() {
            info!("Autoplacing resource {}", spec.name);
            self.send(
                Method::POST,
                &format!("/v1/resource-definitions/{}/autoplace", encode(&spec.name)),
                json!({}),
            )
            .await
            .context(format!("failed to place resource {}", spec.name))?;
            resources = self.resources(&spec.name).await?;
        }

        let definition = self
            .resource_definition(&spec.name)
            .await?
            .ok_or_else(|| Error::not_found("resource-definition", &spec.name))?;

        Ok(Deployment {
            definition,
            group,
            resources,
        })
    }

    async fn delete_resource_definition(&self, name: &str) -> Result<()> {
        info!("Deleting resource definition {}", name);
        self.call(Method::DELETE, &format!("/v1/resource-definitions/{}", encode(name)), None)
            .await
            .map(|_| ())
    }

    async fn delete_volume_definition(&self, name: &str, number: u32) -> Result<()> {
        info!("Deleting volume definition {}/{}", name, number);
        self.call(
            Method::DELETE,
            &format!("/v1/resource-definitions/{}/volume-definitions/{}", encode(name), number),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn deployed(&self, name: &str) -> Result<DeployedState> {
        let Some(definition) = self.resource_definition(name).await? else {
            return Ok(DeployedState::default());
        };
        let group = self.resource_group(&definition.resource_group).await?;
        let volume_definitions = self.volume_definitions(name).await?;
        let resources = self.resources(name).await?;

        Ok(DeployedState {
            definition: Some(definition),
            group,
            volume_definitions,
            resources,
        })
    }

    async fn resources(&self, name: &str) -> Result<Vec<Resource>> {
        let resources: Vec<Rsc> = self
            .get_json(&format!("/v1/view/resources?resources={}", encode(name)))
            .await?;
        Ok(resources.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Config Store
// =============================================================================

/// Promoter configurations kept in the controller
#[derive(Debug, Clone)]
pub struct LinstorConfigStore {
    client: Arc<LinstorClient>,
}

impl LinstorConfigStore {
    pub fn new(client: Arc<LinstorClient>) -> Self {
        Self { client }
    }

    /// Resource-definition property that enables a configuration file
    fn file_property(path: &str) -> String {
        format!("files{}", path)
    }

    /// Whether the daemon may use the file at `path`, given definition props
    fn enables(props: &BTreeMap<String, String>, path: &str) -> bool {
        props.get(&Self::file_property(path)).map(String::as_str) == Some(FILE_ENABLED)
    }

    /// Props switching the file at `path` on or off
    fn file_props(path: &str, enabled: bool) -> BTreeMap<String, String> {
        let value = if enabled { FILE_ENABLED } else { FILE_DISABLED };
        BTreeMap::from([(Self::file_property(path), value.to_string())])
    }

    /// Key-value entries that hold promoter configurations
    fn config_entries(kv: &BTreeMap<String, String>) -> impl Iterator<Item = (&String, &String)> {
        kv.iter().filter(|(k, _)| k.starts_with(CONFIG_DIR))
    }

    async fn is_attached(&self, config: &PromoterConfig, path: &str) -> Result<bool> {
        for resource in config.resources.keys() {
            if let Some(rd) = self.client.resource_definition(resource).await? {
                if Self::enables(&rd.props, path) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn set_file_property(&self, config: &PromoterConfig, enabled: bool) -> Result<()> {
        let path = config.path();
        for resource in config.resources.keys() {
            self.client
                .modify_resource_definition(resource, Self::file_props(&path, enabled), Vec::new())
                .await
                .context(format!("failed to toggle {} on {}", path, resource))?;
        }
        Ok(())
    }

    async fn stored(&self, path: &str, content: &str) -> Result<StoredConfig> {
        let config = PromoterConfig::from_toml(content)?;
        let attached = self.is_attached(&config, path).await?;
        Ok(StoredConfig {
            config,
            path: path.to_string(),
            attached,
        })
    }
}

#[async_trait]
impl HaConfigStore for LinstorConfigStore {
    async fn find(&self, id: &str) -> Result<Option<StoredConfig>> {
        let path = config_path(id);
        let props = self.client.kv_props().await?;
        match props.get(&path) {
            Some(content) => Ok(Some(self.stored(&path, content).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<StoredConfig>> {
        let props = self.client.kv_props().await?;
        let mut configs = Vec::new();
        for (path, content) in Self::config_entries(&props) {
            let config = match PromoterConfig::from_toml(content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Skipping unreadable promoter config {}: {}", path, e);
                    continue;
                }
            };
            let attached = match self.is_attached(&config, path).await {
                Ok(attached) => attached,
                Err(e) => {
                    warn!("Skipping promoter config {}: {}", path, e);
                    continue;
                }
            };
            configs.push(StoredConfig {
                config,
                path: path.clone(),
                attached,
            });
        }
        Ok(configs)
    }

    async fn ensure(&self, config: &PromoterConfig) -> Result<()> {
        let path = config.path();
        info!("Writing promoter config {}", path);
        let mut props = BTreeMap::new();
        props.insert(path, config.to_toml()?);
        self.client.modify_kv(props, Vec::new()).await
    }

    async fn attach(&self, config: &PromoterConfig) -> Result<()> {
        info!("Attaching promoter config {}", config.id);
        self.ensure(config).await?;
        self.set_file_property(config, true).await
    }

    async fn detach(&self, config: &PromoterConfig) -> Result<()> {
        info!("Detaching promoter config {}", config.id);
        self.set_file_property(config, false).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let Some(stored) = self.find(id).await? else {
            return Ok(());
        };
        info!("Deleting promoter config {}", stored.path);

        let key = Self::file_property(&stored.path);
        for resource in stored.config.resources.keys() {
            match self
                .client
                .modify_resource_definition(resource, BTreeMap::new(), vec![key.clone()])
                .await
            {
                Err(e) if e.is_not_found() => {}
                result => result?,
            }
        }
        self.client.modify_kv(BTreeMap::new(), vec![stored.path]).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Request body creating the resource definition for `spec`
fn resource_definition_body(spec: &ResourceSpec) -> serde_json::Value {
    json!({
        "resource_definition": {
            "name": spec.name,
            "resource_group_name": spec.resource_group,
            "props": spec.props,
        }
    })
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Extract the messages from a LINSTOR API call result list
fn api_message(body: &str) -> String {
    match serde_json::from_str::<Vec<ApiCallRc>>(body) {
        Ok(rcs) if !rcs.is_empty() => rcs
            .into_iter()
            .map(|rc| rc.message)
            .collect::<Vec<_>>()
            .join("; "),
        _ => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_list() {
        let config = LinstorConfig::from_controller_list("ctrl-1, https://ctrl-2:3371/,10.0.0.1");
        assert_eq!(
            config.controllers,
            vec![
                "http://ctrl-1:3370",
                "https://ctrl-2:3371",
                "http://10.0.0.1:3370",
            ]
        );

        let config = LinstorConfig::from_controller_list(" , ");
        assert_eq!(config.controllers, vec![DEFAULT_CONTROLLER]);
    }

    #[test]
    fn test_resource_wire_format() {
        let body = r#"[{
            "name": "export1",
            "node_name": "node-a",
            "flags": [],
            "state": {"in_use": true},
            "volumes": [
                {"volume_number": 0, "device_path": "/dev/drbd1000", "state": {"disk_state": "UpToDate"}},
                {"volume_number": 1, "device_path": "/dev/drbd1001", "state": {"disk_state": "SyncTarget"}}
            ]
        }, {
            "name": "export1",
            "node_name": "node-c",
            "flags": ["DISKLESS", "TIE_BREAKER"],
            "state": {}
        }]"#;
        let rscs: Vec<Rsc> = serde_json::from_str(body).unwrap();
        let resources: Vec<Resource> = rscs.into_iter().map(Into::into).collect();

        assert!(resources[0].is_in_use());
        assert_eq!(resources[0].volumes[1].disk_state, DiskState::Unknown);
        assert_eq!(resources[0].volumes[0].device_path.as_deref(), Some("/dev/drbd1000"));
        assert!(resources[1].diskless);
        assert_eq!(resources[1].in_use, None);
    }

    #[test]
    fn test_volume_definition_wire_format() {
        let vd: VlmDfn =
            serde_json::from_str(r#"{"volume_number": 1, "size_kib": 2097152, "flags": ["GROSS_SIZE"]}"#)
                .unwrap();
        let vd = VolumeDefinition::from(vd);
        assert!(vd.gross);
        assert_eq!(vd.size_kib, 2 * 1024 * 1024);

        let rg: RscGrp =
            serde_json::from_str(r#"{"name": "DfltRscGrp", "select_filter": {"place_count": 3}}"#).unwrap();
        assert_eq!(ResourceGroup::from(rg).expected_replicas(), 3);
    }

    #[test]
    fn test_api_message() {
        let body = r#"[{"ret_code": -4611686018407201828, "message": "Resource definition 'x' not found."}]"#;
        assert_eq!(api_message(body), "Resource definition 'x' not found.");
        assert_eq!(api_message("bad gateway\n"), "bad gateway");
    }

    #[test]
    fn test_file_property() {
        assert_eq!(
            LinstorConfigStore::file_property("/etc/drbd-reactor.d/linstor-gateway-nfs-export1.toml"),
            "files/etc/drbd-reactor.d/linstor-gateway-nfs-export1.toml"
        );
    }

    #[test]
    fn test_file_toggle() {
        let path = config_path("nfs-export1");
        let mut props = LinstorConfigStore::file_props(&path, true);
        assert!(LinstorConfigStore::enables(&props, &path));
        assert!(!LinstorConfigStore::enables(&props, &config_path("nfs-other")));

        props.extend(LinstorConfigStore::file_props(&path, false));
        assert_eq!(props.len(), 1);
        assert!(!LinstorConfigStore::enables(&props, &path));
        assert!(!LinstorConfigStore::enables(&BTreeMap::new(), &path));
    }

    #[test]
    fn test_config_entries() {
        let kv = BTreeMap::from([
            (config_path("nfs-export1"), "[[promoter]]".to_string()),
            ("unrelated/key".to_string(), "value".to_string()),
            (config_path("iscsi-disk1"), "[[promoter]]".to_string()),
        ]);
        let paths: Vec<&String> = LinstorConfigStore::config_entries(&kv).map(|(k, _)| k).collect();
        assert_eq!(paths, vec![&config_path("iscsi-disk1"), &config_path("nfs-export1")]);
    }

    #[test]
    fn test_resource_definition_body() {
        let spec = ResourceSpec {
            name: "export1".into(),
            resource_group: "DfltRscGrp".into(),
            volumes: vec![VolumeConfig::new(0, 65536)],
            gross_size: false,
            props: BTreeMap::from([("Aux/gateway/nfs-export-path".to_string(), "/data".to_string())]),
        };
        let body = resource_definition_body(&spec);
        assert_eq!(body["resource_definition"]["name"], "export1");
        assert_eq!(body["resource_definition"]["resource_group_name"], "DfltRscGrp");
        assert_eq!(body["resource_definition"]["props"]["Aux/gateway/nfs-export-path"], "/data");
    }

    /// Serve `router` on a loopback port, returning its base URL
    async fn stub_controller(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_list_skips_config_with_unreadable_attach_state() {
        use axum::extract::Path;
        use axum::http::StatusCode as HttpStatus;
        use axum::response::IntoResponse;
        use axum::routing::get;
        use axum::Json;

        let healthy = PromoterConfig::single("nfs-export1", "export1", vec![]);
        let flaky = PromoterConfig::single("iscsi-flaky", "flaky", vec![]);
        let kv = json!([{
            "props": {
                healthy.path(): healthy.to_toml().unwrap(),
                flaky.path(): flaky.to_toml().unwrap(),
                "unrelated": "value",
            }
        }]);
        let enabled = LinstorConfigStore::file_property(&healthy.path());

        let router = axum::Router::new()
            .route(
                &format!("/v1/key-value-store/{}", KV_INSTANCE),
                get(move || async move { Json(kv) }),
            )
            .route(
                "/v1/resource-definitions/:name",
                get(move |Path(name): Path<String>| async move {
                    if name == "export1" {
                        Json(json!({
                            "name": "export1",
                            "resource_group_name": "DfltRscGrp",
                            "props": { enabled: "True" },
                        }))
                        .into_response()
                    } else {
                        HttpStatus::INTERNAL_SERVER_ERROR.into_response()
                    }
                }),
            );
        let url = stub_controller(router).await;
        let client = LinstorClient::new(url, Duration::from_secs(2)).unwrap();
        let store = LinstorConfigStore::new(Arc::new(client));

        let configs = store.list().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].config.id, "nfs-export1");
        assert!(configs[0].attached);

        // a direct lookup still reports the failure
        let err = store.find("iscsi-flaky").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = LinstorClient::new("http://ctrl-1:3370/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url, "http://ctrl-1:3370");
    }

    #[tokio::test]
    async fn test_connect_without_controller() {
        let config = LinstorConfig {
            controllers: vec!["http://127.0.0.1:9".into()],
            request_timeout: Duration::from_millis(200),
        };
        let err = LinstorClient::connect(&config).await.unwrap_err();
        assert!(err.is_transient());
    }
}
