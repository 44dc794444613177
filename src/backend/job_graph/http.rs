//! HTTP Execution Platform
//!
//! Client for a DNAnexus-style API where every call is
//! `POST {api_url}/{object}/{method}` with a JSON body. The environment's
//! headers (normally `Authorization: Bearer ...`) go on every request.

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};

use super::platform::{AppletSpec, ExecutionPlatform, JobDescription, JobQuery, JobRequest};
use crate::error::{PortabilityError, Result};

/// Converts string headers into a header map, rejecting invalid ones.
pub fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| PortabilityError::Invalid(format!("invalid header name '{}'", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| PortabilityError::Invalid(format!("invalid value for header {}", name)))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct FoundObject {
    id: String,
}

#[derive(Deserialize)]
struct FoundExecution {
    #[serde(default)]
    describe: Option<JobDescription>,
}

#[derive(Deserialize)]
struct SearchResponse<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Deserialize)]
struct LogResponse {
    url: String,
}

/// Platform reached over HTTP.
pub struct HttpPlatform {
    api_url: String,
    client: reqwest::Client,
}

impl HttpPlatform {
    pub fn new(api_url: &str, headers: &HashMap<String, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(header_map(headers)?)
            .build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn route(&self, object: &str, method: &str) -> String {
        format!("{}/{}/{}", self.api_url, object, method)
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, object: &str, method: &str, body: Value) -> Result<T> {
        let url = self.route(object, method);
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Request body creating an applet from its spec.
pub fn applet_body(project: &str, spec: &AppletSpec) -> Value {
    json!({
        "project": project,
        "name": spec.name,
        "title": spec.title,
        "dxapi": "1.0.0",
        "properties": {"version": spec.version},
        "inputSpec": spec.input_spec,
        "outputSpec": spec.output_spec,
        "runSpec": {
            "code": spec.code,
            "interpreter": spec.interpreter,
            "distribution": "Ubuntu",
            "release": "20.04",
            "systemRequirements": {"*": {"instanceType": spec.instance_type}}
        }
    })
}

/// Request body launching a job.
pub fn run_body(request: &JobRequest) -> Value {
    json!({
        "name": request.name,
        "input": request.input,
        "project": request.project,
        "folder": request.folder,
        "dependsOn": request.depends_on,
        "properties": request.properties,
    })
}

/// Request body searching jobs.
pub fn search_body(query: &JobQuery) -> Value {
    let mut body = json!({
        "class": "job",
        "properties": query.properties,
        "describe": true,
    });
    if let Some(name) = &query.name {
        body["name"] = json!(name);
    }
    if let Some(project) = &query.project {
        body["project"] = json!(project);
    }
    if let Some(root) = &query.root_execution {
        body["rootExecution"] = json!(root);
    }
    body
}

#[async_trait]
impl ExecutionPlatform for HttpPlatform {
    async fn create_folder(&self, project: &str, folder: &str) -> Result<()> {
        let _: Value = self
            .call(project, "newFolder", json!({"folder": folder, "parents": true}))
            .await?;
        Ok(())
    }

    async fn find_applet(&self, project: &str, name: &str, version: &str) -> Result<Option<String>> {
        let found: SearchResponse<FoundObject> = self
            .call(
                "system",
                "findDataObjects",
                json!({
                    "class": "applet",
                    "name": name,
                    "state": "closed",
                    "properties": {"version": version},
                    "scope": {"project": project},
                }),
            )
            .await?;
        Ok(found.results.into_iter().next().map(|o| o.id))
    }

    async fn build_applet(&self, project: &str, spec: &AppletSpec) -> Result<String> {
        let created: IdResponse = self.call("applet", "new", applet_body(project, spec)).await?;
        Ok(created.id)
    }

    async fn run_job(&self, request: &JobRequest) -> Result<String> {
        let launched: IdResponse = self
            .call(&request.applet_id, "run", run_body(request))
            .await?;
        Ok(launched.id)
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobDescription>> {
        let found: SearchResponse<FoundExecution> = self
            .call("system", "findExecutions", search_body(query))
            .await?;
        Ok(found.results.into_iter().filter_map(|e| e.describe).collect())
    }

    async fn job_log(&self, job_id: &str) -> Result<String> {
        let log: LogResponse = self.call(job_id, "getLog", json!({})).await?;
        Ok(self
            .client
            .get(&log.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::job_graph::applets::runner_spec;
    use crate::backend::job_graph::platform::Properties;

    #[test]
    fn test_header_map() {
        let headers = HashMap::from([("Authorization".to_string(), "Bearer abc".to_string())]);
        let map = header_map(&headers).unwrap();
        assert_eq!(map["authorization"], "Bearer abc");

        let bad = HashMap::from([("Bad Header".to_string(), "x".to_string())]);
        assert!(header_map(&bad).is_err());
    }

    #[test]
    fn test_routes() {
        let platform = HttpPlatform::new("https://api.example.com/", &HashMap::new()).unwrap();
        assert_eq!(
            platform.route("applet-1", "run"),
            "https://api.example.com/applet-1/run"
        );
    }

    #[test]
    fn test_request_bodies() {
        let body = applet_body("project-1", &runner_spec("0.0.17"));
        assert_eq!(body["properties"]["version"], "0.0.17");
        assert_eq!(body["inputSpec"][2]["optional"], true);

        let request = JobRequest {
            applet_id: "applet-1".to_string(),
            name: "job".to_string(),
            project: "project-1".to_string(),
            folder: "/w1".to_string(),
            input: json!({"url": "https://h/a"}),
            depends_on: vec!["job-0".to_string()],
            properties: Properties::from([("wes_id".to_string(), "w1".to_string())]),
        };
        let body = run_body(&request);
        assert_eq!(body["dependsOn"][0], "job-0");
        assert_eq!(body["properties"]["wes_id"], "w1");

        let body = search_body(&JobQuery::tagged("wes_id", "w1"));
        assert_eq!(body["describe"], true);
        assert!(body.get("name").is_none());
        assert!(body.get("rootExecution").is_none());

        let body = search_body(&JobQuery::under("job-1"));
        assert_eq!(body["rootExecution"], "job-1");
    }
}
