//! reqwest-backed implementation of [`AutoscalingGceClient`].

use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use regex::Regex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::core::gce_ref::generate_instance_url;
use crate::core::gce_ref::parse_instance_url;
use crate::core::gce_ref::region_of_zone;
use crate::core::gce_ref::GceRef;
use crate::core::types::GceInstance;
use crate::core::types::InstanceState;
use crate::core::types::InstanceTemplate;
use crate::core::types::InstanceTemplateName;
use crate::core::types::MachineType;
use crate::core::types::ManagedInstanceGroup;
use crate::platform::auth::TokenSource;
use crate::platform::gce::client::generate_instance_name;
use crate::platform::gce::client::instance_ids_to_names;
use crate::platform::gce::client::AutoscalingGceClient;
use crate::platform::gce::client::GceClientConfig;
use crate::platform::gce::error_info::attribute_errors;
use crate::platform::gce::operation::wait_for_operation;
use crate::platform::gce::operation::OperationState;
use crate::platform::gce::operation::WaitPolicy;
use crate::platform::gce::wire::CreateInstancesRequest;
use crate::platform::gce::wire::DeleteInstancesRequest;
use crate::platform::gce::wire::InstanceGroupManagerResource;
use crate::platform::gce::wire::InstanceGroupResource;
use crate::platform::gce::wire::InstanceTemplateResource;
use crate::platform::gce::wire::ListPage;
use crate::platform::gce::wire::MachineTypeResource;
use crate::platform::gce::wire::ManagedInstanceResource;
use crate::platform::gce::wire::OperationResource;
use crate::platform::gce::wire::PerInstanceConfig;
use crate::platform::gce::wire::RegionResource;
use crate::platform::metrics::ApiCallCounter;
use crate::platform::transport::JsonTransport;
use crate::platform::CloudError;
use crate::platform::CloudResult;

/// Compute API client speaking JSON over HTTPS.
pub struct GceRestClient {
    transport: JsonTransport,
    config: GceClientConfig,
    calls: ApiCallCounter,
}

impl GceRestClient {
    pub fn new(
        config: GceClientConfig,
        tokens: Arc<dyn TokenSource>,
        calls: ApiCallCounter,
    ) -> CloudResult<Self> {
        let transport = JsonTransport::new(config.request_timeout, &config.user_agent, tokens)?;
        info!(domain = %config.compute_domain, project = %config.project, "Compute client created");
        Ok(Self {
            transport,
            config,
            calls,
        })
    }

    fn project_url(&self, project: &str) -> String {
        format!("{}/compute/v1/projects/{project}", self.config.compute_domain)
    }

    fn mig_url(&self, mig: &GceRef) -> String {
        format!(
            "{}/zones/{}/instanceGroupManagers/{}",
            self.project_url(&mig.project),
            mig.zone,
            mig.name
        )
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> CloudResult<T> {
        self.transport.get(url).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: &str,
        body: Option<&B>,
    ) -> CloudResult<T> {
        self.transport.post(url, body).await
    }

    /// Consumes all pages; any failure discards what was read so far.
    async fn list_pages<T: DeserializeOwned>(&self, method: Method, url: &str) -> CloudResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.transport.request(method.clone(), url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            if method == Method::POST {
                request = request.header(reqwest::header::CONTENT_LENGTH, 0);
            }
            let page: ListPage<T> = self.transport.send(request, url).await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(items),
            }
        }
    }

    /// Polls a zonal operation until it is done, failed, or the configured deadline passes.
    pub async fn wait_for_operation(
        &self,
        operation: &OperationResource,
        project: &str,
        zone: &str,
        is_deletion: bool,
    ) -> CloudResult<()> {
        let policy = WaitPolicy {
            poll_interval: if is_deletion {
                self.config.operation_deletion_poll_interval
            } else {
                self.config.operation_poll_interval
            },
            timeout: self.config.operation_wait_timeout,
        };
        let url = format!(
            "{}/zones/{zone}/operations/{}",
            self.project_url(project),
            operation.name
        );
        let target = if operation.target_link.is_empty() {
            format!("{project}/{zone}")
        } else {
            operation.target_link.clone()
        };
        wait_for_operation(&operation.name, &target, policy, || async {
            self.calls.register("zone_operations", "get");
            let op: OperationResource = self.get(&url).await?;
            debug!(operation = %op.name, status = %op.status, operation_type = %op.operation_type, "Operation status");
            Ok(OperationState::from(&op))
        })
        .await
    }
}

fn group_not_found(report: Report<CloudError>, mig: &GceRef) -> Report<CloudError> {
    if matches!(report.current_context(), CloudError::NotFound { .. }) {
        report.change_context(CloudError::GroupDoesNotExist {
            group: mig.to_string(),
        })
    } else {
        report
    }
}

fn to_instance(managed: &ManagedInstanceResource, counts: &mut BTreeMap<String, usize>) -> Option<GceInstance> {
    let instance_ref = match parse_instance_url(&managed.instance) {
        Ok(r) => r,
        Err(e) => {
            error!(url = %managed.instance, "Received error while parsing of the instance url: {e}");
            return None;
        }
    };
    let mut instance = GceInstance::new(
        instance_ref,
        InstanceState::from_current_action(&managed.current_action),
    );
    instance.numeric_id = managed.id;
    instance.template_name = managed
        .instance_template
        .as_deref()
        .and_then(InstanceTemplateName::from_url);

    if instance.state == InstanceState::Creating {
        let errors = managed.last_attempt_errors();
        instance.error_info = attribute_errors(errors, &managed.instance_status, counts);
        if !errors.is_empty() {
            debug!(
                instance = %managed.instance,
                error_info = ?instance.error_info,
                "Got instance which is being created and has lastAttemptErrors"
            );
        }
    }
    Some(instance)
}

#[async_trait::async_trait]
impl AutoscalingGceClient for GceRestClient {
    async fn fetch_machine_type(&self, zone: &str, machine_type: &str) -> CloudResult<MachineType> {
        self.calls.register("machine_types", "get");
        let url = format!(
            "{}/zones/{zone}/machineTypes/{machine_type}",
            self.project_url(&self.config.project)
        );
        let resource: MachineTypeResource = self.get(&url).await?;
        Ok(resource.into())
    }

    async fn fetch_machine_types(&self, zone: &str) -> CloudResult<Vec<MachineType>> {
        self.calls.register("machine_types", "list");
        let url = format!("{}/zones/{zone}/machineTypes", self.project_url(&self.config.project));
        let resources: Vec<MachineTypeResource> = self.list_pages(Method::GET, &url).await?;
        Ok(resources.into_iter().map(Into::into).collect())
    }

    async fn fetch_all_migs(&self, zone: &str) -> CloudResult<Vec<ManagedInstanceGroup>> {
        self.calls.register("instance_group_managers", "list");
        let url = format!(
            "{}/zones/{zone}/instanceGroupManagers",
            self.project_url(&self.config.project)
        );
        let resources: Vec<InstanceGroupManagerResource> = self.list_pages(Method::GET, &url).await?;
        Ok(resources
            .into_iter()
            .map(|resource| {
                let mut mig = ManagedInstanceGroup::from(resource);
                if mig.zone.is_empty() {
                    mig.zone = zone.to_string();
                }
                mig
            })
            .collect())
    }

    async fn fetch_mig(&self, mig: &GceRef) -> CloudResult<ManagedInstanceGroup> {
        self.calls.register("instance_group_managers", "get");
        let resource: InstanceGroupManagerResource = self
            .get(&self.mig_url(mig))
            .await
            .map_err(|e| group_not_found(e, mig))?;
        let mut group = ManagedInstanceGroup::from(resource);
        if group.zone.is_empty() {
            group.zone = mig.zone.clone();
        }
        Ok(group)
    }

    async fn fetch_mig_instances(&self, mig: &GceRef) -> CloudResult<Vec<GceInstance>> {
        self.calls.register("instance_group_managers", "list_managed_instances");
        let url = format!("{}/listManagedInstances", self.mig_url(mig));
        let managed: Vec<ManagedInstanceResource> = self
            .list_pages(Method::POST, &url)
            .await
            .map_err(|e| group_not_found(e, mig))
            .inspect_err(|e| debug!(mig = %mig, "Failed MIG info request: {e:?}"))?;

        let mut code_counts = BTreeMap::new();
        let instances: Vec<GceInstance> = managed
            .iter()
            .filter_map(|m| to_instance(m, &mut code_counts))
            .collect();
        if !code_counts.is_empty() {
            warn!(mig = %mig, ?code_counts, "Spotted following instance creation error codes");
        }
        Ok(instances)
    }

    async fn fetch_mig_template(
        &self,
        mig: &GceRef,
        template_name: &str,
        regional: bool,
    ) -> CloudResult<InstanceTemplate> {
        self.calls.register("instance_templates", "get");
        let url = if regional {
            let region = region_of_zone(&mig.zone).ok_or_else(|| {
                Report::new(CloudError::Configuration {
                    message: format!("unexpected zone: {}", mig.zone),
                })
            })?;
            format!(
                "{}/regions/{region}/instanceTemplates/{template_name}",
                self.project_url(&mig.project)
            )
        } else {
            format!(
                "{}/global/instanceTemplates/{template_name}",
                self.project_url(&mig.project)
            )
        };
        let resource: InstanceTemplateResource = self.get(&url).await?;
        Ok(resource.into())
    }

    async fn fetch_migs_with_name(&self, zone: &str, filter: &Regex) -> CloudResult<Vec<String>> {
        self.calls.register("instance_groups", "list");
        let url = format!("{}/zones/{zone}/instanceGroups", self.project_url(&self.config.project));
        let groups: Vec<InstanceGroupResource> = self
            .list_pages(Method::GET, &url)
            .await
            .attach_printable("cannot list managed instance groups")?;
        Ok(groups
            .into_iter()
            .filter(|group| {
                filter
                    .find(&group.name)
                    .is_some_and(|m| m.start() == 0 && m.end() == group.name.len())
            })
            .inspect(|group| debug!(name = %group.name, filter = %filter, "Found managed instance group matching regexp"))
            .map(|group| group.self_link)
            .collect())
    }

    async fn fetch_zones(&self, region: &str) -> CloudResult<Vec<String>> {
        self.calls.register("regions", "get");
        let url = format!("{}/regions/{region}", self.project_url(&self.config.project));
        let resource: RegionResource = self
            .get(&url)
            .await
            .attach_printable_lazy(|| format!("cannot get zones for GCE region {region}"))?;
        Ok(resource
            .zones
            .iter()
            .filter_map(|link| link.rsplit('/').next())
            .map(str::to_string)
            .collect())
    }

    async fn resize_mig(&self, mig: &GceRef, size: i64) -> CloudResult<()> {
        self.calls.register("instance_group_managers", "resize");
        let url = format!("{}/resize?size={size}", self.mig_url(mig));
        let op: OperationResource = self
            .post::<(), _>(&url, None)
            .await
            .map_err(|e| group_not_found(e, mig))?;
        self.wait_for_operation(&op, &mig.project, &mig.zone, false).await
    }

    async fn delete_instances(&self, mig: &GceRef, instances: &[GceRef]) -> CloudResult<()> {
        self.calls.register("instance_group_managers", "delete_instances");
        let request = DeleteInstancesRequest {
            instances: instances.iter().map(generate_instance_url).collect(),
            skip_instances_on_validation_error: true,
        };
        let url = format!("{}/deleteInstances", self.mig_url(mig));
        let op: OperationResource = self
            .post(&url, Some(&request))
            .await
            .map_err(|e| group_not_found(e, mig))?;
        self.wait_for_operation(&op, &mig.project, &mig.zone, true).await
    }

    async fn create_instances(
        &self,
        mig: &GceRef,
        base_name: &str,
        delta: i64,
        existing_provider_ids: &[String],
    ) -> CloudResult<()> {
        self.calls.register("instance_group_managers", "create_instances");
        let mut names = instance_ids_to_names(existing_provider_ids);
        let mut request = CreateInstancesRequest {
            instances: Vec::with_capacity(usize::try_from(delta).unwrap_or_default()),
        };
        for _ in 0..delta {
            let name = generate_instance_name(base_name, &names);
            names.insert(name.clone());
            request.instances.push(PerInstanceConfig { name });
        }
        let url = format!("{}/createInstances", self.mig_url(mig));
        let op: OperationResource = self
            .post(&url, Some(&request))
            .await
            .map_err(|e| group_not_found(e, mig))?;
        self.wait_for_operation(&op, &mig.project, &mig.zone, false).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use parking_lot::Mutex;
    use poem::handler;
    use poem::http::StatusCode;
    use poem::listener::TcpAcceptor;
    use poem::web::Data;
    use poem::web::Json;
    use poem::web::Path;
    use poem::web::Query;
    use poem::EndpointExt;
    use poem::Route;
    use poem::Server;
    use serde::Deserialize;
    use serde_json::json;
    use serde_json::Value;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::core::types::ErrorCode;
    use crate::platform::auth::StaticTokenSource;

    const ZONE: &str = "us-central1-b";

    #[derive(Default)]
    struct FakeCompute {
        operation_polls: Mutex<HashMap<String, usize>>,
        last_body: Mutex<Option<Value>>,
        resize_to: Mutex<Option<i64>>,
    }

    #[derive(Deserialize)]
    struct PageQuery {
        #[serde(rename = "pageToken")]
        page_token: Option<String>,
    }

    #[derive(Deserialize)]
    struct SizeQuery {
        size: i64,
    }

    fn igm(name: &str, size: i64) -> Value {
        json!({
            "name": name,
            "zone": format!("https://www.googleapis.com/compute/v1/projects/p1/zones/{ZONE}"),
            "baseInstanceName": format!("{name}-base"),
            "targetSize": size,
            "instanceTemplate": format!("https://www.googleapis.com/compute/v1/projects/p1/global/instanceTemplates/{name}-tmpl"),
            "selfLink": format!("https://www.googleapis.com/compute/v1/projects/p1/zones/{ZONE}/instanceGroupManagers/{name}"),
        })
    }

    fn running_op(name: &str) -> Json<Value> {
        Json(json!({"name": name, "status": "RUNNING", "operationType": "test"}))
    }

    #[handler]
    fn list_igms(Query(q): Query<PageQuery>) -> Json<Value> {
        match q.page_token.as_deref() {
            None => Json(json!({"items": [igm("ng1", 1)], "nextPageToken": "page-2"})),
            Some(_) => Json(json!({"items": [igm("ng2", 2)]})),
        }
    }

    #[handler]
    fn get_igm(Path((_project, _zone, name)): Path<(String, String, String)>) -> poem::Result<Json<Value>> {
        if name == "missing" {
            return Err(poem::Error::from_status(StatusCode::NOT_FOUND));
        }
        Ok(Json(igm(&name, 3)))
    }

    #[handler]
    fn resize(Query(q): Query<SizeQuery>, state: Data<&Arc<FakeCompute>>) -> Json<Value> {
        *state.resize_to.lock() = Some(q.size);
        running_op("op-resize")
    }

    #[handler]
    fn delete_instances(Json(body): Json<Value>, state: Data<&Arc<FakeCompute>>) -> Json<Value> {
        *state.last_body.lock() = Some(body);
        running_op("op-delete")
    }

    #[handler]
    fn create_instances(Json(body): Json<Value>, state: Data<&Arc<FakeCompute>>) -> Json<Value> {
        *state.last_body.lock() = Some(body);
        running_op("op-create")
    }

    #[handler]
    fn get_operation(Path((_p, _z, op)): Path<(String, String, String)>, state: Data<&Arc<FakeCompute>>) -> Json<Value> {
        let mut polls = state.operation_polls.lock();
        let n = polls.entry(op.clone()).or_default();
        *n += 1;
        if op == "op-create" {
            return Json(json!({
                "name": op,
                "status": "DONE",
                "error": {"errors": [{"code": "QUOTA_EXCEEDED", "message": "no quota"}]}
            }));
        }
        let status = if *n < 3 { "RUNNING" } else { "DONE" };
        Json(json!({"name": op, "status": status}))
    }

    #[handler]
    fn list_managed_instances() -> Json<Value> {
        Json(json!({
            "managedInstances": [
                {
                    "instance": format!("https://www.googleapis.com/compute/v1/projects/p1/zones/{ZONE}/instances/ng1-base-aaaa"),
                    "instanceStatus": "RUNNING",
                    "currentAction": "NONE",
                    "id": "1234"
                },
                {
                    "instance": format!("https://www.googleapis.com/compute/v1/projects/p1/zones/{ZONE}/instances/ng1-base-bbbb"),
                    "currentAction": "CREATING",
                    "lastAttempt": {"errors": {"errors": [
                        {"code": "ZONE_RESOURCE_POOL_EXHAUSTED", "message": "pool"},
                        {"code": "QUOTA_EXCEEDED", "message": "quota"}
                    ]}}
                },
                {"instance": "garbage", "currentAction": "NONE"}
            ]
        }))
    }

    #[handler]
    fn get_template() -> Json<Value> {
        Json(json!({
            "name": "ng1-tmpl",
            "properties": {
                "machineType": "n1-standard-2",
                "metadata": {"items": [{"key": "kube-env", "value": "KUBE: env\n"}]}
            }
        }))
    }

    #[handler]
    fn get_region() -> Json<Value> {
        Json(json!({"zones": [
            "https://www.googleapis.com/compute/v1/projects/p1/zones/us-central1-a",
            "https://www.googleapis.com/compute/v1/projects/p1/zones/us-central1-b"
        ]}))
    }

    #[handler]
    fn list_instance_groups() -> Json<Value> {
        Json(json!({"items": [
            {"name": "gke-pool-1", "selfLink": "https://www.googleapis.com/compute/v1/projects/p1/zones/us-central1-b/instanceGroups/gke-pool-1"},
            {"name": "other-gke-pool-1", "selfLink": "https://www.googleapis.com/compute/v1/projects/p1/zones/us-central1-b/instanceGroups/other-gke-pool-1"}
        ]}))
    }

    async fn client() -> (GceRestClient, Arc<FakeCompute>, ApiCallCounter) {
        let state = Arc::new(FakeCompute::default());
        let base = "/compute/v1/projects/:project/zones/:zone/instanceGroupManagers";
        let app = Route::new()
            .at(base, poem::get(list_igms))
            .at(format!("{base}/:name"), poem::get(get_igm))
            .at(format!("{base}/:name/resize"), poem::post(resize))
            .at(format!("{base}/:name/deleteInstances"), poem::post(delete_instances))
            .at(format!("{base}/:name/createInstances"), poem::post(create_instances))
            .at(format!("{base}/:name/listManagedInstances"), poem::post(list_managed_instances))
            .at("/compute/v1/projects/:project/zones/:zone/operations/:op", poem::get(get_operation))
            .at("/compute/v1/projects/:project/zones/:zone/instanceGroups", poem::get(list_instance_groups))
            .at("/compute/v1/projects/:project/global/instanceTemplates/:name", poem::get(get_template))
            .at("/compute/v1/projects/:project/regions/:region", poem::get(get_region))
            .data(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TcpAcceptor::from_tokio(listener).unwrap();
        tokio::spawn(async move {
            let _ = Server::new_with_acceptor(acceptor).run(app).await;
        });

        let calls = ApiCallCounter::new();
        let config = GceClientConfig::new("p1")
            .with_compute_domain(format!("http://{addr}"))
            .with_operation_poll_interval(Duration::from_millis(1))
            .with_operation_deletion_poll_interval(Duration::from_millis(1))
            .with_operation_wait_timeout(Duration::from_secs(5));
        let client =
            GceRestClient::new(config, Arc::new(StaticTokenSource::new("t")), calls.clone()).unwrap();
        (client, state, calls)
    }

    #[test(tokio::test)]
    async fn lists_all_pages() {
        let (client, _, calls) = client().await;
        let migs = client.fetch_all_migs(ZONE).await.unwrap();
        assert_eq!(
            migs.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            vec!["ng1", "ng2"]
        );
        assert_eq!(migs[1].zone, ZONE);
        assert_eq!(calls.get("instance_group_managers", "list"), 1);
    }

    #[test(tokio::test)]
    async fn missing_group_is_typed() {
        let (client, _, _) = client().await;
        let err = client
            .fetch_mig_target_size(&GceRef::new("p1", ZONE, "missing"))
            .await
            .unwrap_err();
        assert_eq!(
            err.current_context(),
            &CloudError::GroupDoesNotExist {
                group: format!("p1/{ZONE}/missing")
            }
        );
        let size = client
            .fetch_mig_target_size(&GceRef::new("p1", ZONE, "ng1"))
            .await
            .unwrap();
        assert_eq!(size, 3);
    }

    #[test(tokio::test)]
    async fn template_name_derived_from_group() {
        let (client, _, _) = client().await;
        let name = client
            .fetch_mig_template_name(&GceRef::new("p1", ZONE, "ng1"))
            .await
            .unwrap();
        assert_eq!(
            name,
            InstanceTemplateName {
                name: "ng1-tmpl".into(),
                regional: false
            }
        );
        let template = client
            .fetch_mig_template(&GceRef::new("p1", ZONE, "ng1"), &name.name, false)
            .await
            .unwrap();
        assert_eq!(template.kube_env_value().unwrap(), "KUBE: env\n");
    }

    #[test(tokio::test)]
    async fn resize_waits_for_operation() {
        let (client, state, calls) = client().await;
        client
            .resize_mig(&GceRef::new("p1", ZONE, "ng1"), 5)
            .await
            .unwrap();
        assert_eq!(*state.resize_to.lock(), Some(5));
        assert_eq!(state.operation_polls.lock().get("op-resize"), Some(&3));
        assert_eq!(calls.get("zone_operations", "get"), 3);
    }

    #[test(tokio::test)]
    async fn delete_skips_invalid_instances() {
        let (client, state, _) = client().await;
        client
            .delete_instances(
                &GceRef::new("p1", ZONE, "ng1"),
                &[GceRef::new("p1", ZONE, "vm-1")],
            )
            .await
            .unwrap();
        let body = state.last_body.lock().clone().unwrap();
        assert_eq!(body["skipInstancesOnValidationError"], json!(true));
        assert_eq!(
            body["instances"],
            json!([format!(
                "https://content.googleapis.com/compute/v1/projects/p1/zones/{ZONE}/instances/vm-1"
            )])
        );
    }

    #[test(tokio::test)]
    async fn create_surfaces_operation_error() {
        let (client, state, _) = client().await;
        let err = client
            .create_instances(
                &GceRef::new("p1", ZONE, "ng1"),
                "ng1-base",
                2,
                &[format!("gce://p1/{ZONE}/ng1-base-aaaa")],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            CloudError::OperationFailed { .. }
        ));
        assert!(err.current_context().to_string().contains("QUOTA_EXCEEDED"));
        let body = state.last_body.lock().clone().unwrap();
        let names = body["instances"].as_array().unwrap();
        assert_eq!(names.len(), 2);
        assert!(names
            .iter()
            .all(|n| n["name"].as_str().unwrap().starts_with("ng1-base-")));
    }

    #[test(tokio::test)]
    async fn managed_instances_carry_state_and_errors() {
        let (client, _, _) = client().await;
        let instances = client
            .fetch_mig_instances(&GceRef::new("p1", ZONE, "ng1"))
            .await
            .unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].state, InstanceState::Running);
        assert_eq!(instances[0].numeric_id, Some(1234));
        assert_eq!(instances[1].state, InstanceState::Creating);
        let info = instances[1].error_info.as_ref().unwrap();
        assert_eq!(info.code, ErrorCode::QuotaExceeded);
        assert_eq!(info.message, "pool; quota");
    }

    #[test(tokio::test)]
    async fn zones_of_region_and_named_groups() {
        let (client, _, _) = client().await;
        assert_eq!(
            client.fetch_zones("us-central1").await.unwrap(),
            vec!["us-central1-a".to_string(), "us-central1-b".to_string()]
        );
        let links = client
            .fetch_migs_with_name(ZONE, &Regex::new("gke-.+").unwrap())
            .await
            .unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].ends_with("/gke-pool-1"));
    }
}
