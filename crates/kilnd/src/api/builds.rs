use super::{ApiError, AppState};
use crate::{config, source};
use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use models::api::{CreateBuildRequest, CreateBuildResponse};
use models::{Build, BuildSource, BuildSpec, PackageJob};
use std::collections::HashSet;
use std::sync::Arc;

pub async fn create(
    State(app): State<Arc<AppState>>,
    Json(request): Json<CreateBuildRequest>,
) -> Result<(StatusCode, Json<CreateBuildResponse>), ApiError> {
    let selectors = [
        request.config_yaml.is_some(),
        !request.configs.is_empty(),
        request.git_source.is_some(),
    ]
    .into_iter()
    .filter(|selected| *selected)
    .count();
    if selectors != 1 {
        return Err(ApiError::Validation(
            "exactly one of config_yaml, configs, or git_source must be provided".to_string(),
        ));
    }

    let configs = if let Some(config_yaml) = &request.config_yaml {
        vec![config_yaml.clone()]
    } else if !request.configs.is_empty() {
        request.configs.clone()
    } else {
        let git = request.git_source.as_ref().expect("selector count is one");
        source::discover_git_configs(&git.url, git.reference.as_deref())
            .await
            .map_err(|err| ApiError::Validation(format!("git source: {err:#}")))?
    };

    let mut packages = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for config_yaml in &configs {
        let parsed = config::parse_package(config_yaml)
            .map_err(|err| ApiError::Validation(format!("invalid package configuration: {err:#}")))?;
        if !seen.insert(parsed.name.clone()) {
            return Err(ApiError::Validation(format!(
                "duplicate package {:?}",
                parsed.name
            )));
        }

        let mut package = PackageJob::new(&parsed.name, config_yaml, parsed.dependencies);
        package.pipelines = request.pipelines.clone();
        if let Some(files) = request.source_files.get(&parsed.name) {
            package.source_files = files.clone();
        }
        packages.push(package);
    }
    if packages.is_empty() {
        return Err(ApiError::Validation(
            "a build requires at least one package configuration".to_string(),
        ));
    }

    let spec = BuildSpec {
        arch: request
            .arch
            .clone()
            .unwrap_or_else(|| app.default_arch.clone()),
        backend_selector: request.backend_selector.clone(),
        pipelines: request.pipelines.clone(),
        source_files: request.source_files.clone(),
        with_test: request.with_test,
        debug: request.debug,
        source: match &request.git_source {
            Some(git) => BuildSource::Git {
                url: git.url.clone(),
                reference: git.reference.clone(),
            },
            None => BuildSource::Inline,
        },
    };

    let build = app.store.create_build(packages, spec).await?;
    tracing::info!(
        build = %build.id,
        packages = build.packages.len(),
        arch = %build.spec.arch,
        "created build",
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateBuildResponse {
            packages: build.packages.iter().map(|p| p.name.clone()).collect(),
            id: build.id,
        }),
    ))
}

pub async fn list(State(app): State<Arc<AppState>>) -> Result<Json<Vec<Build>>, ApiError> {
    Ok(Json(app.store.list_builds().await?))
}

pub async fn get(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Build>, ApiError> {
    Ok(Json(app.store.get_build(&id).await?))
}
