//! Live [`VmLister`] backed by the vSphere VI/JSON API.
//!
//! All calls go to `{scheme}://{host}/sdk/vim25/{release}/...` and carry the
//! `vmware-api-session-id` header obtained from `SessionManager.Login`.

pub mod types;
pub mod vm;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use percent_encoding::percent_decode_str;
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument};
use url::Url;

use crate::error::ProviderError;
use crate::provider::{VmHandle, VmLister};
use types::{
    FindByInventoryPathRequest, LoginRequest, ManagedObjectReference, ServiceContent, TaskInfo,
    TaskState, VirtualMachineSummary,
};
pub use vm::VSphereVm;

pub const DEFAULT_API_RELEASE: &str = "8.0.1.0";
const SESSION_HEADER: &str = "vmware-api-session-id";
const SUMMARY_FETCH_CONCURRENCY: usize = 8;

/// How to reach and talk to vCenter.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Accept self-signed certificates.
    pub insecure: bool,
    /// VI/JSON API release, e.g. `8.0.1.0`.
    pub api_release: String,
    pub request_timeout: Duration,
    pub task_poll_interval: Duration,
    /// Overrides the user info embedded in the URL.
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            insecure: false,
            api_release: DEFAULT_API_RELEASE.to_string(),
            request_timeout: Duration::from_secs(60),
            task_poll_interval: Duration::from_millis(500),
            username: None,
            password: None,
        }
    }
}

struct Session {
    http: reqwest::Client,
    base: Url,
    session_id: String,
    search_index: ManagedObjectReference,
    task_poll_interval: Duration,
}

/// Authenticated vSphere client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    session: Arc<Session>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base", &self.session.base.as_str())
            .field("session_id", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Log in to the vCenter at `url` (user info in the URL supplies credentials).
    pub async fn connect(url: &Url, opts: &ConnectOptions) -> Result<Self, ProviderError> {
        let base = api_base(url, &opts.api_release)?;
        let (username, password) = credentials(url, opts)?;

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(opts.insecure)
            .timeout(opts.request_timeout)
            .build()?;

        let content: ServiceContent = decode(
            http.get(join(&base, "ServiceInstance/ServiceInstance/content")?)
                .send()
                .await?,
        )
        .await?;

        let session_manager = content
            .session_manager
            .ok_or_else(|| ProviderError::Session("service has no session manager".to_string()))?;

        let login = http
            .post(join(
                &base,
                &format!("SessionManager/{}/Login", session_manager.value),
            )?)
            .json(&LoginRequest {
                user_name: &username,
                password: &password,
            })
            .send()
            .await?;

        let session_id = login
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        ensure_success(login).await?;

        let session_id = session_id.ok_or_else(|| {
            ProviderError::Session(format!("login response carried no {SESSION_HEADER} header"))
        })?;

        info!(base = %base, user = %username, "logged in to vSphere");

        Ok(Self {
            session: Arc::new(Session {
                http,
                base,
                session_id,
                search_index: content.search_index,
                task_poll_interval: opts.task_poll_interval,
            }),
        })
    }

    async fn call<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ProviderError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = join(&self.session.base, path)?;
        let mut request = self
            .session
            .http
            .request(method, url)
            .header(SESSION_HEADER, &self.session.session_id);

        if let Some(body) = body {
            request = request.json(body);
        }

        decode(request.send().await?).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        self.call::<(), T>(Method::GET, path, None).await
    }

    /// Resolve an inventory path to a folder.
    #[instrument(skip(self))]
    pub async fn find_folder(&self, path: &str) -> Result<ManagedObjectReference, ProviderError> {
        let found: Option<ManagedObjectReference> = self
            .call(
                Method::POST,
                &format!(
                    "SearchIndex/{}/FindByInventoryPath",
                    self.session.search_index.value
                ),
                Some(&FindByInventoryPathRequest {
                    inventory_path: path,
                }),
            )
            .await?;

        let folder = found.ok_or_else(|| ProviderError::FolderNotFound(path.to_string()))?;
        if !folder.is("Folder") {
            return Err(ProviderError::NotAFolder {
                path: path.to_string(),
                kind: folder.kind,
            });
        }

        Ok(folder)
    }

    pub(crate) async fn summary(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<VirtualMachineSummary, ProviderError> {
        self.get(&format!("VirtualMachine/{}/summary", vm.value)).await
    }

    /// Start `method` on a VM and wait for the resulting task.
    pub(crate) async fn run_vm_task(
        &self,
        vm: &ManagedObjectReference,
        method: &str,
    ) -> Result<(), ProviderError> {
        let task: ManagedObjectReference = self
            .call::<(), _>(
                Method::POST,
                &format!("VirtualMachine/{}/{method}", vm.value),
                None,
            )
            .await?;

        self.wait_for_task(&task).await
    }

    async fn wait_for_task(&self, task: &ManagedObjectReference) -> Result<(), ProviderError> {
        let mut ticker = tokio::time::interval(self.session.task_poll_interval);

        loop {
            ticker.tick().await;

            let info: TaskInfo = self.get(&format!("Task/{}/info", task.value)).await?;
            match info.state {
                TaskState::Success => return Ok(()),
                TaskState::Error => {
                    return Err(ProviderError::TaskFailed {
                        task: task.value.clone(),
                        message: info
                            .error
                            .and_then(|e| e.localized_message)
                            .unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                TaskState::Queued | TaskState::Running => {
                    debug!(task = %task.value, state = ?info.state, "waiting for task");
                }
            }
        }
    }
}

#[async_trait]
impl VmLister for Client {
    async fn list_vms(&self, path: &str) -> Result<Vec<VmHandle>, ProviderError> {
        let folder = self.find_folder(path).await?;

        let children: Vec<ManagedObjectReference> = self
            .get(&format!("Folder/{}/childEntity", folder.value))
            .await?;

        futures::stream::iter(
            children
                .into_iter()
                .filter(|child| child.is("VirtualMachine")),
        )
        .map(|reference| async move {
            let summary = self.summary(&reference).await?;
            Ok::<VmHandle, ProviderError>(Arc::new(VSphereVm::new(
                self.clone(),
                reference,
                &summary,
            )))
        })
        .buffered(SUMMARY_FETCH_CONCURRENCY)
        .try_collect()
        .await
    }
}

fn api_base(url: &Url, release: &str) -> Result<Url, ProviderError> {
    let host = url
        .host_str()
        .ok_or_else(|| ProviderError::Session(format!("vSphere URL has no host: {url}")))?;

    let mut base = format!("{}://{host}", url.scheme());
    if let Some(port) = url.port() {
        base.push_str(&format!(":{port}"));
    }
    base.push_str(&format!("/sdk/vim25/{release}/"));

    Url::parse(&base).map_err(|e| ProviderError::Session(format!("invalid vSphere URL: {e}")))
}

fn credentials(url: &Url, opts: &ConnectOptions) -> Result<(String, String), ProviderError> {
    let decode = |raw: &str| percent_decode_str(raw).decode_utf8_lossy().into_owned();

    let username = opts
        .username
        .clone()
        .unwrap_or_else(|| decode(url.username()));
    let password = opts
        .password
        .clone()
        .or_else(|| url.password().map(decode))
        .unwrap_or_default();

    if username.is_empty() {
        return Err(ProviderError::Session(
            "no vSphere username in URL or options".to_string(),
        ));
    }

    Ok((username, password))
}

fn join(base: &Url, path: &str) -> Result<Url, ProviderError> {
    base.join(path)
        .map_err(|e| ProviderError::Transport(format!("invalid request path {path}: {e}")))
}

async fn ensure_success(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Http {
        status: status.as_u16(),
        message: fault_message(&body),
    })
}

/// Decode a JSON body. An empty body (204) decodes as JSON `null`.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    let response = ensure_success(response).await?;
    let bytes = response.bytes().await?;

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_str("null")?);
    }

    Ok(serde_json::from_slice(&bytes)?)
}

/// Pull the human-readable message out of a VI/JSON fault body.
fn fault_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("localizedMessage")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}
