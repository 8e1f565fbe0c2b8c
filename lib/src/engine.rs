//! The narrow slice of the Docker engine API this crate depends on, modeled as a
//! trait so the core is testable without a real daemon. [`BollardEngine`] is the
//! production implementation, backed by the same `bollard` client the rest of the
//! corpus uses to talk to the Docker daemon.

use std::{collections::HashMap, future::Future};

use bollard::{
    container::{
        Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
        RemoveContainerOptions, StopContainerOptions,
    },
    image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions},
    models::{ContainerCreateResponse, ContainerInspectResponse, ContainerSummary, ImageInspect, ImageSummary},
    Docker,
};
use color_eyre::{eyre::Context, Result};
use futures_lite::StreamExt;

/// Everything the orchestrator needs from the container engine.
///
/// Read operations (`list_images`, `inspect_image`, `list_containers`, `inspect_container`)
/// may run concurrently with anything else. Mutating operations on a single container
/// (`stop_container`, `remove_container`, `create_container`, `start_container`) must be
/// serialized per-container by the caller; this trait does not serialize them itself.
pub trait Engine: Send + Sync {
    /// Lists every local image.
    fn list_images(&self) -> impl Future<Output = Result<Vec<ImageSummary>>> + Send;

    /// Inspects a single local image by ID or reference.
    fn inspect_image(&self, id: &str) -> impl Future<Output = Result<ImageInspect>> + Send;

    /// Pulls an image, attaching the given registry auth header if present.
    fn pull_image(
        &self,
        reference: &str,
        auth: Option<RegistryAuth>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Removes a local image by ID.
    fn remove_image(&self, id: &str, prune_children: bool) -> impl Future<Output = Result<()>> + Send;

    /// Lists containers, optionally including stopped ones.
    fn list_containers(&self, all: bool) -> impl Future<Output = Result<Vec<ContainerSummary>>> + Send;

    /// Inspects a single container by ID.
    fn inspect_container(&self, id: &str) -> impl Future<Output = Result<ContainerInspectResponse>> + Send;

    /// Stops a container, honoring an optional stop signal override.
    fn stop_container(&self, id: &str, signal: Option<&str>) -> impl Future<Output = Result<()>> + Send;

    /// Removes a (stopped) container.
    fn remove_container(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Creates a container from the given config, returning its new ID.
    fn create_container(
        &self,
        name: &str,
        config: ContainerConfig<String>,
    ) -> impl Future<Output = Result<ContainerCreateResponse>> + Send;

    /// Starts a container.
    fn start_container(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Prunes dangling images, returning the IDs of images actually removed.
    fn prune_images(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Registry auth to attach to a pull, mirroring [`bollard::auth::DockerCredentials`]
/// without forcing every caller to depend on bollard's auth type directly.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    /// Username, for Basic-style registry auth.
    pub username: Option<String>,
    /// Password or token, for Basic-style registry auth.
    pub password: Option<String>,
    /// Pre-negotiated Bearer identity token, when already resolved by the registry client.
    pub identity_token: Option<String>,
    /// Registry host this credential applies to.
    pub server_address: Option<String>,
}

impl From<RegistryAuth> for bollard::auth::DockerCredentials {
    fn from(auth: RegistryAuth) -> Self {
        bollard::auth::DockerCredentials {
            username: auth.username,
            password: auth.password,
            identitytoken: auth.identity_token,
            serveraddress: auth.server_address,
            ..Default::default()
        }
    }
}

/// Production [`Engine`] implementation backed by a connected `bollard::Docker` client.
#[derive(Debug, Clone)]
pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    /// Connects to the local Docker daemon using the platform default (socket or pipe).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("connect to docker daemon")?;
        Ok(Self { docker })
    }

    /// Wraps an already-connected client, e.g. one built with custom TLS options.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

impl Engine for BollardEngine {
    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context("list images")
    }

    async fn inspect_image(&self, id: &str) -> Result<ImageInspect> {
        self.docker.inspect_image(id).await.context("inspect image")
    }

    async fn pull_image(&self, reference: &str, auth: Option<RegistryAuth>) -> Result<()> {
        let options = Some(CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        });
        let credentials = auth.map(Into::into);
        let mut stream = self.docker.create_image(options, None, credentials);
        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("pull {reference}"))?;
        }
        Ok(())
    }

    async fn remove_image(&self, id: &str, prune_children: bool) -> Result<()> {
        self.docker
            .remove_image(
                id,
                Some(RemoveImageOptions {
                    noprune: !prune_children,
                    ..Default::default()
                }),
                None,
            )
            .await
            .with_context(|| format!("remove image {id}"))?;
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        self.docker
            .list_containers(Some(ListContainersOptions::<String> {
                all,
                ..Default::default()
            }))
            .await
            .context("list containers")
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(id, None)
            .await
            .with_context(|| format!("inspect container {id}"))
    }

    async fn stop_container(&self, id: &str, signal: Option<&str>) -> Result<()> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: Some(10),
                    signal: signal.map(str::to_string),
                }),
            )
            .await
            .with_context(|| format!("stop container {id}"))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(id, Some(RemoveContainerOptions::default()))
            .await
            .with_context(|| format!("remove container {id}"))
    }

    async fn create_container(
        &self,
        name: &str,
        config: ContainerConfig<String>,
    ) -> Result<ContainerCreateResponse> {
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .with_context(|| format!("create container {name}"))
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .with_context(|| format!("start container {id}"))
    }

    async fn prune_images(&self) -> Result<Vec<String>> {
        let report = self.docker.prune_images(None).await.context("prune images")?;
        Ok(report
            .images_deleted
            .unwrap_or_default()
            .into_iter()
            .filter_map(|deleted| deleted.deleted.or(deleted.untagged))
            .collect())
    }
}

/// Parses an image's `RepoDigests` entries into a `repository -> digest` map, the
/// shape the digest checker and in-use collector both need.
pub fn repo_digests(image: &ImageInspect) -> HashMap<String, String> {
    image
        .repo_digests
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| {
            let (repo, digest) = entry.split_once('@')?;
            Some((repo.to_string(), digest.to_string()))
        })
        .collect()
}
