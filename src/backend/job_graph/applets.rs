//! Applet Catalog
//!
//! The two applets a job graph is made of, and the find-or-build lookup
//! that keeps applet creation idempotent. Applets are identified by name
//! plus the `version` property; a version bump builds a fresh applet
//! instead of touching the old one.

use std::collections::HashMap;

use log::info;
use tokio::sync::Mutex;

use super::platform::{AppletSpec, ExecutionPlatform, IoSpec};
use crate::error::Result;

pub const LOCALIZER_APPLET: &str = "wes_url_localizer";
pub const RUNNER_APPLET: &str = "wes_dxwdl_runner";

/// Job names, used when searching for a run's coordination job.
pub const LOCALIZER_JOB_NAME: &str = "WES URL Localizer";
pub const RUNNER_JOB_NAME: &str = "WES dxWDL Runner";

/// Prefix marking a parameter value as the output of a localization job.
pub const LOCALIZER_HANDLE_PREFIX: &str = "localizer-";

const LOCALIZER_CODE: &str = r#"
main() {
    source_url="$url"
    case "$source_url" in
        gs://*) source_url="https://storage.googleapis.com/${source_url#gs://}" ;;
    esac
    name=$(basename "${url%%\?*}")
    curl -sSfL "$source_url" -o "$name"
    file_id=$(dx upload "$name" --destination "$project:/$wes_id/" --property wes_id="$wes_id" --brief)
    dx-jobutil-add-output localized_file "$file_id" --class=file
}
"#;

const RUNNER_CODE: &str = r#"
main() {
    printf '%s' "$workflow_descriptor" > workflow.wdl
    params="$workflow_params"
    for handle in $(grep -o 'localizer-job-[A-Za-z0-9]\{24\}' <<< "$params" | sort -u); do
        file_id=$(dx describe "${handle#localizer-}" --json | jq -r '.output.localized_file["$dnanexus_link"]')
        params=${params//$handle/dx://$file_id}
    done
    printf '%s' "$params" > dx_inputs.json

    imports=()
    if [ -n "$workflow_dependencies" ]; then
        printf '%s' "$workflow_dependencies" | base64 -d > dependencies.zip
        unzip -q -d wdl_dependencies dependencies.zip
        imports=(-imports wdl_dependencies)
    fi

    wget -q https://github.com/dnanexus/dxWDL/releases/download/0.61.1/dxWDL-0.61.1.jar
    export DX_WORKSPACE_ID="$project" DX_PROJECT_CONTEXT_ID="$project"
    workflow=$(java -jar dxWDL-0.61.1.jar compile workflow.wdl \
        -inputs dx_inputs.json -destination "/$wes_id" "${imports[@]}")
    dx run "$workflow" -f dx_inputs.dx.json --property wes_id="$wes_id" --yes --brief
}
"#;

/// Applet fetching one remote reference into a platform file.
pub fn localizer_spec(version: &str) -> AppletSpec {
    AppletSpec {
        name: LOCALIZER_APPLET.to_string(),
        title: LOCALIZER_JOB_NAME.to_string(),
        version: version.to_string(),
        input_spec: vec![
            IoSpec::required("url", "string"),
            IoSpec::required("project", "string"),
            IoSpec::required("wes_id", "string"),
        ],
        output_spec: vec![IoSpec::required("localized_file", "file")],
        interpreter: "bash".to_string(),
        code: LOCALIZER_CODE.trim_start().to_string(),
        instance_type: "mem1_ssd1_x2".to_string(),
    }
}

/// Applet translating the workflow into a platform workflow and running it.
pub fn runner_spec(version: &str) -> AppletSpec {
    AppletSpec {
        name: RUNNER_APPLET.to_string(),
        title: RUNNER_JOB_NAME.to_string(),
        version: version.to_string(),
        input_spec: vec![
            IoSpec::required("workflow_descriptor", "string"),
            IoSpec::required("workflow_params", "string"),
            IoSpec::optional("workflow_dependencies", "string"),
            IoSpec::required("project", "string"),
            IoSpec::required("wes_id", "string"),
        ],
        output_spec: Vec::new(),
        interpreter: "bash".to_string(),
        code: RUNNER_CODE.trim_start().to_string(),
        instance_type: "mem1_ssd1_x4".to_string(),
    }
}

/// Applet ids resolved so far, keyed by project, name and version.
#[derive(Default)]
pub struct AppletCatalog {
    resolved: Mutex<HashMap<(String, String, String), String>>,
}

impl AppletCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of the applet described by `spec`, building it only
    /// if the platform has none.
    ///
    /// Lookups are serialized so concurrent submissions in this process
    /// never build the same applet twice.
    pub async fn ensure(
        &self,
        platform: &dyn ExecutionPlatform,
        project: &str,
        spec: &AppletSpec,
    ) -> Result<String> {
        let key = (project.to_string(), spec.name.clone(), spec.version.clone());
        let mut resolved = self.resolved.lock().await;
        if let Some(id) = resolved.get(&key) {
            return Ok(id.clone());
        }

        let id = match platform.find_applet(project, &spec.name, &spec.version).await? {
            Some(id) => id,
            None => {
                info!("Building applet {} {} in {}", spec.name, spec.version, project);
                platform.build_applet(project, spec).await?
            }
        };
        resolved.insert(key, id.clone());
        Ok(id)
    }
}
