//! [`ScmService`] over HTTP.

use super::{ComponentTree, NamedItem, RemoteNode, RemoteRoot, ScmService};
use crate::error::{Result, SyncError};
use crate::transport::AuthenticatingTransport;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Body, Method, Request, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::path::{Component, Path};
use tokio::io::AsyncReadExt;

/// Upload chunk size for streamed file bodies
pub const UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct HttpScmService {
    transport: AuthenticatingTransport,
    base: String,
}

impl HttpScmService {
    pub fn new(transport: AuthenticatingTransport) -> Self {
        let base = transport.base_url().as_str().trim_end_matches('/').to_string();
        Self { transport, base }
    }

    pub fn transport(&self) -> &AuthenticatingTransport {
        &self.transport
    }

    /// Base URL extended with escaped path segments
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.transport.base_url().clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("{} cannot be used as a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn item_url(&self, root: &RemoteRoot, component_id: &str, path: &Path) -> Result<Url> {
        let rel = path_segments(path)?;
        let segments = [root.collection(), root.id(), component_id]
            .into_iter()
            .chain(rel.iter().map(String::as_str));
        self.url(segments)
    }

    async fn send(&self, request: Request, expected: StatusCode) -> Result<Response> {
        let url = request.url().to_string();
        let response = self.transport.execute(request).await?.ok_or_else(|| {
            SyncError::Authentication(format!("request to {} could not be replayed", url))
        })?;
        check_status(response, expected).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let request = self.transport.request(Method::GET, url).build()?;
        let response = self.send(request, StatusCode::OK).await?;
        decode(response).await
    }

    async fn post_op(&self, url: Url) -> Result<Response> {
        let request = self.transport.request(Method::POST, url).build()?;
        self.send(request, StatusCode::OK).await
    }

    async fn upload_request(&self, url: &Url, local: &Path) -> Result<Request> {
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|e| SyncError::io(local, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| SyncError::io(local, e))?
            .len();

        let mut request = self
            .transport
            .request(Method::POST, url.clone())
            .body(file_body(file))
            .build()?;
        let headers = request.headers_mut();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        Ok(request)
    }

    async fn create(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        parent: &Path,
        name: &str,
        op: &str,
    ) -> Result<RemoteNode> {
        let mut url = self.item_url(root, component_id, parent)?;
        url.query_pairs_mut()
            .append_pair("op", op)
            .append_pair("name", name);
        let response = self.post_op(url).await?;
        decode(response).await
    }
}

#[async_trait]
impl ScmService for HttpScmService {
    fn base_url(&self) -> &str {
        &self.base
    }

    async fn find_stream(&self, project: &str, name: &str) -> Result<Option<String>> {
        let mut url = self.url(["projects", project, "streams"])?;
        url.query_pairs_mut().append_pair("name", name);
        let items: Vec<NamedItem> = self.get_json(url).await?;
        Ok(pick_named(items, name))
    }

    async fn find_workspace(
        &self,
        project: &str,
        name: &str,
        owner: &str,
    ) -> Result<Option<String>> {
        let mut url = self.url(["projects", project, "workspaces"])?;
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("owner", owner);
        let items: Vec<NamedItem> = self.get_json(url).await?;
        Ok(pick_named(items, name))
    }

    async fn create_workspace(
        &self,
        project: &str,
        name: &str,
        flow_target: &str,
    ) -> Result<String> {
        let mut url = self.url(["projects", project, "workspaces"])?;
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("flowTarget", flow_target);
        let response = self.post_op(url).await?;
        let created: NamedItem = decode(response).await?;
        tracing::info!("Created workspace {} ({})", created.name, created.item_id);
        Ok(created.item_id)
    }

    async fn fetch_root(&self, root: &RemoteRoot) -> Result<RemoteNode> {
        let url = self.url([root.collection(), root.id()])?;
        self.get_json(url).await
    }

    async fn fetch_component(
        &self,
        root: &RemoteRoot,
        component_id: &str,
    ) -> Result<ComponentTree> {
        let url = self.url([root.collection(), root.id(), component_id])?;
        let request = self.transport.request(Method::GET, url).build()?;
        let response = self.send(request, StatusCode::OK).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let node = decode(response).await?;
        Ok(ComponentTree { node, etag })
    }

    async fn download(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        path: &Path,
    ) -> Result<Bytes> {
        let url = self.item_url(root, component_id, path)?;
        let request = self.transport.request(Method::GET, url).build()?;
        let response = self.send(request, StatusCode::OK).await?;
        Ok(response.bytes().await?)
    }

    async fn write_content(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        path: &Path,
        local: &Path,
    ) -> Result<RemoteNode> {
        let mut url = self.item_url(root, component_id, path)?;
        url.query_pairs_mut().append_pair("op", "writeContent");

        let request = self.upload_request(&url, local).await?;
        let response = match self.transport.execute(request).await? {
            Some(response) => response,
            None => {
                // Streamed body was consumed by the auth challenge
                let request = self.upload_request(&url, local).await?;
                self.transport.execute(request).await?.ok_or_else(|| {
                    SyncError::Authentication(format!("upload to {} was rejected twice", url))
                })?
            }
        };
        let response = check_status(response, StatusCode::OK).await?;
        decode(response).await
    }

    async fn create_folder(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        parent: &Path,
        name: &str,
    ) -> Result<RemoteNode> {
        self.create(root, component_id, parent, name, "createFolder")
            .await
    }

    async fn create_file(
        &self,
        root: &RemoteRoot,
        component_id: &str,
        parent: &Path,
        name: &str,
    ) -> Result<RemoteNode> {
        self.create(root, component_id, parent, name, "createFile")
            .await
    }

    async fn delete(&self, root: &RemoteRoot, component_id: &str, path: &Path) -> Result<()> {
        let mut url = self.item_url(root, component_id, path)?;
        url.query_pairs_mut().append_pair("op", "delete");
        self.post_op(url).await?;
        Ok(())
    }

    async fn refresh(&self, root: &RemoteRoot) -> Result<()> {
        let url = self.url([root.collection(), root.id(), "refresh"])?;
        let request = self
            .transport
            .request(Method::POST, url)
            .header("Jazz-Version", "2")
            .header("X-Requested-With", "XMLHttpRequest")
            .header(CONTENT_TYPE, "application/json")
            .body(r#"{"Load": true}"#)
            .build()?;
        self.send(request, StatusCode::ACCEPTED).await?;
        Ok(())
    }
}

fn pick_named(items: Vec<NamedItem>, name: &str) -> Option<String> {
    items
        .into_iter()
        .find(|item| item.name == name)
        .map(|item| item.item_id)
}

/// Split a relative path into URL segments
fn path_segments(path: &Path) -> Result<Vec<String>> {
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    SyncError::Config(format!("path is not valid UTF-8: {}", path.display()))
                })?;
                segments.push(part.to_string());
            }
            Component::CurDir => {}
            _ => {
                return Err(SyncError::Config(format!(
                    "remote path must be relative: {}",
                    path.display()
                )))
            }
        }
    }
    Ok(segments)
}

async fn check_status(response: Response, expected: StatusCode) -> Result<Response> {
    if response.status() == expected {
        return Ok(response);
    }
    let url = response.url().to_string();
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::protocol(url, status, body))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Stream `file` in fixed-size chunks; such a body cannot be cloned
fn file_body(file: tokio::fs::File) -> Body {
    let chunks = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = BytesMut::with_capacity(UPLOAD_CHUNK_SIZE);
        let n = file.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        Ok(Some((buf.freeze(), file)))
    });
    Body::wrap_stream(chunks)
}
