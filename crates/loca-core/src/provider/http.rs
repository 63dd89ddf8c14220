//! HTTP and Server-Sent Events plumbing shared by the adapters.

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::ProviderError;

/// User-Agent sent with every backend request.
pub const LOCA_USER_AGENT: &str = concat!("loca/", env!("CARGO_PKG_VERSION"));

/// What the stream loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// Per-backend interpretation of SSE events.
pub trait SseHandler {
    /// Handle one event. Text fragments are passed to `on_delta` in
    /// arrival order.
    fn on_event(
        &mut self,
        event: &str,
        data: &str,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<Flow, ProviderError>;
}

/// Headers common to all backends; callers add auth on top.
pub fn base_headers(streaming: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(LOCA_USER_AGENT));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    if streaming {
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    }
    headers
}

/// Insert a header whose value comes from user configuration.
pub fn insert_secret(
    headers: &mut HeaderMap,
    backend: &str,
    name: &'static str,
    value: &str,
) -> Result<(), ProviderError> {
    let mut value = HeaderValue::from_str(value).map_err(|_| {
        ProviderError::api(backend, format!("{name} header contains invalid characters"))
    })?;
    value.set_sensitive(true);
    headers.insert(name, value);
    Ok(())
}

/// POST a JSON body and fail on any non-success status.
pub async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    backend: &str,
    url: &str,
    headers: HeaderMap,
    body: &T,
) -> Result<reqwest::Response, ProviderError> {
    let response = client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(backend, &e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::http_status(backend, status.as_u16(), &body));
    }
    Ok(response)
}

/// Read a whole response body as JSON.
pub async fn read_json<T: DeserializeOwned>(
    backend: &str,
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let text = response
        .text()
        .await
        .map_err(|e| ProviderError::from_reqwest(backend, &e))?;
    parse_json(backend, &text, "response")
}

/// Decode a JSON payload, naming `what` in the error.
pub fn parse_json<T: DeserializeOwned>(
    backend: &str,
    data: &str,
    what: &str,
) -> Result<T, ProviderError> {
    serde_json::from_str(data)
        .map_err(|e| ProviderError::parse(backend, format!("failed to parse {what}: {e}")))
}

/// Feed every SSE event of a byte stream to `handler` until it reports
/// [`Flow::Done`] or the stream ends.
pub async fn drive_sse<S, B, E, H>(
    backend: &str,
    bytes: S,
    handler: &mut H,
    on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
) -> Result<(), ProviderError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error,
    H: SseHandler + ?Sized,
{
    let mut events = std::pin::pin!(bytes.eventsource());
    while let Some(event) = events.next().await {
        let event =
            event.map_err(|e| ProviderError::parse(backend, format!("SSE stream error: {e}")))?;
        if handler.on_event(&event.event, &event.data, on_delta)? == Flow::Done {
            break;
        }
    }
    Ok(())
}

/// Join a configured base URL and an API path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
