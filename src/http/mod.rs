//! HTTP and WebSocket access for computers, gated by the firewall.
//!
//! Network I/O runs on a dedicated tokio runtime owned by [`HttpService`].
//! Each computer gets its own [`HttpApi`] per boot, which bounds how much
//! network work it may have in flight and cancels all of it when the
//! computer stops. Requests past the limit wait their turn; websockets and
//! URL checks past theirs are refused. Results are delivered as events.

pub mod address;
pub mod request;
pub mod websocket;

pub use address::{check_uri, resolve, ResolvedAddress, UrlKind};
pub use request::{HttpRequest, HTTP_FAILURE, HTTP_SUCCESS, MAX_REDIRECTS, MAX_TIMEOUT};
pub use websocket::{
    WebsocketHandle, WEBSOCKET_CLOSED, WEBSOCKET_FAILURE, WEBSOCKET_MESSAGE, WEBSOCKET_SUCCESS,
};

use std::any::Any;
use std::sync::Arc;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::computer::{Api, ApiFactory, ComputerHandle, Value};
use crate::config::HttpConfig;
use crate::firewall::Firewall;
use crate::Result;

/// Name the API is registered under.
pub const API_NAME: &str = "http";

/// Event fired with the outcome of [`HttpApi::check_url`].
pub const HTTP_CHECK: &str = "http_check";

pub const TOO_MANY_REQUESTS: &str = "Too many ongoing HTTP requests";
pub const TOO_MANY_WEBSOCKETS: &str = "Too many websockets already open";
pub const TOO_MANY_CHECKS: &str = "Too many ongoing check_url calls";

/// Concurrent `check_url` calls allowed per computer.
pub const MAX_CHECKS: usize = 512;

/// Resolves once `cancel` is set, or its sender is gone.
pub(crate) async fn wait_cancelled(mut cancel: watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

/// Resolves once the step that issued the work is hard-aborted.
pub(crate) async fn wait_aborted(abort: Option<watch::Receiver<bool>>) {
    match abort {
        Some(abort) => wait_cancelled(abort).await,
        None => std::future::pending().await,
    }
}

/// Owns the network runtime.
pub struct HttpService {
    runtime: Option<Runtime>,
    handle: Handle,
    firewall: Arc<Firewall>,
    max_requests: usize,
    max_websockets: usize,
}

impl HttpService {
    pub fn new(config: &HttpConfig, firewall: Arc<Firewall>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.network_threads)
            .thread_name("Network")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        info!(
            threads = config.network_threads,
            max_requests = config.max_requests,
            max_websockets = config.max_websockets,
            "HTTP service started"
        );

        Ok(Self {
            runtime: Some(runtime),
            handle,
            firewall,
            max_requests: config.max_requests,
            max_websockets: config.max_websockets,
        })
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    /// Handle to the network runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Factory registering [`HttpApi`] on each computer.
    pub fn api_factory(&self) -> HttpApiFactory {
        HttpApiFactory {
            handle: self.handle.clone(),
            firewall: Arc::clone(&self.firewall),
            max_requests: self.max_requests,
            max_websockets: self.max_websockets,
        }
    }
}

impl Drop for HttpService {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            debug!("HTTP service stopped");
        }
    }
}

/// Bounds and cancels the network work of one computer.
///
/// Requests queue on their semaphore, which hands out permits in arrival
/// order. Closing the group closes every semaphore, failing queued waiters.
struct ResourceGroup {
    requests: Arc<Semaphore>,
    websockets: Arc<Semaphore>,
    checks: Arc<Semaphore>,
    cancel: watch::Sender<bool>,
}

impl ResourceGroup {
    fn new(max_requests: usize, max_websockets: usize, max_checks: usize) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            requests: Arc::new(Semaphore::new(max_requests)),
            websockets: Arc::new(Semaphore::new(max_websockets)),
            checks: Arc::new(Semaphore::new(max_checks)),
            cancel,
        }
    }

    /// Wait for a request slot. `None` once the group is closed.
    async fn request_slot(requests: Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        requests.acquire_owned().await.ok()
    }

    fn try_check(&self) -> std::result::Result<OwnedSemaphorePermit, String> {
        self.checks
            .clone()
            .try_acquire_owned()
            .map_err(|_| TOO_MANY_CHECKS.to_string())
    }

    fn try_websocket(&self) -> std::result::Result<OwnedSemaphorePermit, String> {
        self.websockets
            .clone()
            .try_acquire_owned()
            .map_err(|_| TOO_MANY_WEBSOCKETS.to_string())
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn cancel(&self) {
        self.cancel.send_replace(true);
        self.requests.close();
        self.websockets.close();
        self.checks.close();
    }
}

/// Builds [`HttpApi`] instances. See [`HttpService::api_factory`].
#[derive(Clone)]
pub struct HttpApiFactory {
    handle: Handle,
    firewall: Arc<Firewall>,
    max_requests: usize,
    max_websockets: usize,
}

impl ApiFactory for HttpApiFactory {
    fn create(&self, computer: &ComputerHandle) -> Option<Arc<dyn Api>> {
        Some(Arc::new(HttpApi {
            computer: computer.clone(),
            handle: self.handle.clone(),
            firewall: Arc::clone(&self.firewall),
            resources: ResourceGroup::new(self.max_requests, self.max_websockets, MAX_CHECKS),
        }))
    }
}

/// The `http` API of one computer.
///
/// Methods validate synchronously and return an error message for the
/// script; everything involving the network completes later as an event.
pub struct HttpApi {
    computer: ComputerHandle,
    handle: Handle,
    firewall: Arc<Firewall>,
    resources: ResourceGroup,
}

impl HttpApi {
    /// Start a request. Fires `http_success` or `http_failure`.
    ///
    /// Past `max_requests` the request waits until an earlier one finishes.
    pub fn request(&self, request: HttpRequest) -> std::result::Result<(), String> {
        if self.resources.is_cancelled() {
            return Err(TOO_MANY_REQUESTS.to_string());
        }
        let address = request.url.clone();
        let prepared = request::PreparedRequest::new(request)?;

        let computer = self.computer.clone();
        let firewall = Arc::clone(&self.firewall);
        let requests = Arc::clone(&self.resources.requests);
        let cancel = self.resources.subscribe();
        let abort = computer.abort_signal();
        debug!(computer_id = computer.id(), url = %address, "HTTP request queued");

        self.handle.spawn(async move {
            let permit = tokio::select! {
                _ = wait_cancelled(cancel.clone()) => return,
                permit = ResourceGroup::request_slot(requests) => permit,
            };
            let Some(_permit) = permit else {
                return;
            };

            let result = tokio::select! {
                _ = wait_cancelled(cancel) => return,
                _ = wait_aborted(abort) => {
                    debug!(url = %address, "HTTP request dropped by hard abort");
                    return;
                }
                result = request::execute(&firewall, prepared) => result,
            };

            match result {
                Ok(response) => {
                    computer.queue_event(HTTP_SUCCESS, vec![Value::from(address), response]);
                }
                Err(failure) => {
                    let mut args = vec![Value::from(address), Value::from(failure.message)];
                    args.extend(failure.response);
                    computer.queue_event(HTTP_FAILURE, args);
                }
            }
        });
        Ok(())
    }

    /// Check a URL is valid and permitted. Fires `http_check`.
    pub fn check_url(&self, url: &str) -> std::result::Result<(), String> {
        self.check_open()?;
        let parsed = check_uri(url, UrlKind::Http)?;
        let permit = self.resources.try_check()?;

        let address = url.to_string();
        let computer = self.computer.clone();
        let firewall = Arc::clone(&self.firewall);
        let cancel = self.resources.subscribe();

        self.handle.spawn(async move {
            let _permit = permit;
            let result = tokio::select! {
                _ = wait_cancelled(cancel) => return,
                result = resolve(&firewall, &parsed) => result,
            };

            let args = match result {
                Ok(_) => vec![Value::from(address), Value::Bool(true)],
                Err(message) => vec![
                    Value::from(address),
                    Value::Bool(false),
                    Value::from(message),
                ],
            };
            computer.queue_event(HTTP_CHECK, args);
        });
        Ok(())
    }

    /// Open a websocket. Fires `websocket_success` or `websocket_failure`.
    pub fn websocket(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> std::result::Result<(), String> {
        self.check_open()?;
        let parsed = check_uri(url, UrlKind::Websocket)?;
        let permit = self.resources.try_websocket()?;

        self.handle.spawn(websocket::run(websocket::Connect {
            url: parsed,
            headers,
            computer: self.computer.clone(),
            firewall: Arc::clone(&self.firewall),
            permit,
            cancel: self.resources.subscribe(),
            abort: self.computer.abort_signal(),
        }));
        Ok(())
    }

    fn check_open(&self) -> std::result::Result<(), String> {
        if self.resources.is_cancelled() {
            Err("HTTP is not available".to_string())
        } else {
            Ok(())
        }
    }
}

impl Api for HttpApi {
    fn name(&self) -> &str {
        API_NAME
    }

    fn shutdown(&self) {
        debug!(computer_id = self.computer.id(), "Cancelling network work");
        self.resources.cancel();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
