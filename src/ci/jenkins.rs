use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{Artifact, BuildInfo, CiError, CiServer, TriggerParams, CORRELATION_PARAM};
use crate::config::CiConfig;

const BUILDS_TREE: &str = "builds[number,url,actions[parameters[name,value]],building,result]";
const ARTIFACTS_TREE: &str = "artifacts[fileName,relativePath]";

/// Jenkins remote-access API client.
pub struct JenkinsClient {
    http: reqwest::Client,
    base: reqwest::Url,
    credentials: Option<(String, String)>,
}

#[derive(Deserialize)]
struct JobResponse {
    #[serde(default)]
    builds: Vec<BuildResponse>,
}

#[derive(Deserialize)]
struct BuildResponse {
    number: u64,
    url: String,
    #[serde(default)]
    building: bool,
    result: Option<String>,
    #[serde(default)]
    actions: Vec<ActionResponse>,
}

#[derive(Deserialize)]
struct ActionResponse {
    #[serde(default)]
    parameters: Option<Vec<ParameterResponse>>,
}

#[derive(Deserialize)]
struct ParameterResponse {
    name: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct ArtifactsResponse {
    #[serde(default)]
    artifacts: Vec<Artifact>,
}

impl From<BuildResponse> for BuildInfo {
    fn from(build: BuildResponse) -> Self {
        let parameters = build
            .actions
            .into_iter()
            .filter_map(|action| action.parameters)
            .flatten()
            .map(|param| {
                let value = match param.value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (param.name, value)
            })
            .collect();
        BuildInfo {
            number: build.number,
            url: build.url,
            building: build.building,
            result: build.result,
            parameters,
        }
    }
}

impl JenkinsClient {
    pub fn new(config: &CiConfig, timeout: Duration) -> Result<Self, CiError> {
        let mut base = reqwest::Url::parse(&config.url)
            .map_err(|_| CiError::InvalidUrl(config.url.clone()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .user_agent("pr-buildbot")
            .timeout(timeout)
            .build()?;
        let credentials = match (&config.user, &config.pass) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Ok(Self {
            http,
            base,
            credentials,
        })
    }

    fn job_url(&self, project: &str, path: &str) -> Result<reqwest::Url, CiError> {
        self.base
            .join(&format!("job/{project}/{path}"))
            .map_err(|_| CiError::InvalidUrl(format!("{}job/{project}/{path}", self.base)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }
}

#[async_trait]
impl CiServer for JenkinsClient {
    #[instrument(skip(self, params), fields(job = %params.job_id, pull = params.pull_number))]
    async fn trigger_build(&self, project: &str, params: &TriggerParams) -> Result<(), CiError> {
        let url = self.job_url(project, "buildWithParameters")?;
        let mut query = vec![
            ("cause", format!("Testing Pull Request: {}", params.pull_number)),
            ("REPOSITORY_URL", params.repository_url.clone()),
            ("BRANCH_NAME", params.branch.clone()),
            (CORRELATION_PARAM, params.job_id.clone()),
            ("PULL", params.pull_number.to_string()),
        ];
        if let Some(token) = &params.token {
            query.push(("token", token.clone()));
        }
        let response = self.authorize(self.http.post(url)).query(&query).send().await?;
        if !response.status().is_success() {
            return Err(CiError::Rejected {
                status: response.status().as_u16(),
            });
        }
        debug!("build triggered");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_builds(&self, project: &str) -> Result<Vec<BuildInfo>, CiError> {
        let url = self.job_url(project, "api/json")?;
        let response: JobResponse = self
            .authorize(self.http.get(url))
            .query(&[("tree", BUILDS_TREE)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.builds.into_iter().map(BuildInfo::from).collect())
    }

    #[instrument(skip(self, build), fields(build = build.number))]
    async fn list_artifacts(
        &self,
        project: &str,
        build: &BuildInfo,
    ) -> Result<Vec<Artifact>, CiError> {
        let url = self.job_url(project, &format!("{}/api/json", build.number))?;
        let response: ArtifactsResponse = self
            .authorize(self.http.get(url))
            .query(&[("tree", ARTIFACTS_TREE)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let base = if build.url.ends_with('/') {
            build.url.clone()
        } else {
            format!("{}/", build.url)
        };
        Ok(response
            .artifacts
            .into_iter()
            .map(|artifact| Artifact {
                url: format!("{base}artifact/{}", artifact.relative_path),
                ..artifact
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn fetch_artifact(&self, url: &str) -> Result<String, CiError> {
        let body = self
            .authorize(self.http.get(url))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        debug!(bytes = body.len(), "fetched artifact");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_parameters_from_all_actions() {
        let json = r#"{
            "builds": [{
                "number": 12,
                "url": "http://ci/job/widgets/12/",
                "building": false,
                "result": "SUCCESS",
                "actions": [
                    {},
                    { "parameters": [
                        { "name": "JOB", "value": "abc-123" },
                        { "name": "PULL", "value": 7 },
                        { "name": "DRY_RUN", "value": false }
                    ] }
                ]
            }, {
                "number": 11,
                "url": "http://ci/job/widgets/11/",
                "building": true,
                "result": null
            }]
        }"#;
        let response: JobResponse = serde_json::from_str(json).unwrap();
        let builds: Vec<BuildInfo> = response.builds.into_iter().map(BuildInfo::from).collect();
        assert_eq!(builds[0].correlation_token(), Some("abc-123"));
        assert!(builds[0]
            .parameters
            .contains(&("PULL".to_string(), "7".to_string())));
        assert!(builds[0]
            .parameters
            .contains(&("DRY_RUN".to_string(), "false".to_string())));
        assert!(builds[1].parameters.is_empty());
    }

    #[test]
    fn test_job_url_keeps_base_path() {
        let config = CiConfig {
            url: "http://ci.example.com:8080/jenkins".to_string(),
            ..CiConfig::default()
        };
        let client = JenkinsClient::new(&config, Duration::from_secs(5)).unwrap();
        let url = client.job_url("widgets", "api/json").unwrap();
        assert_eq!(url.as_str(), "http://ci.example.com:8080/jenkins/job/widgets/api/json");
    }

    #[test]
    fn test_invalid_base_url() {
        let config = CiConfig {
            url: "not a url".to_string(),
            ..CiConfig::default()
        };
        assert!(matches!(
            JenkinsClient::new(&config, Duration::from_secs(5)),
            Err(CiError::InvalidUrl(_))
        ));
    }
}
