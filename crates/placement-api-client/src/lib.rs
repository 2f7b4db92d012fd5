use anyhow::Context;
use placement_api_types::*;
use std::time::Duration;

pub use reqwest::Url;

/// A check may legitimately take as long as the server's poll budget,
/// which defaults to 5 minutes, so leave some headroom over that.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(360);

/// A non-success response from the server
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("request status {status}: {error}")]
pub struct ApiError {
    pub status: u16,
    /// The `error` field of the response body, or the raw body
    /// if it was not in the usual shape
    pub error: String,
}

pub struct PlacementApiClient {
    endpoint: Url,
    timeout: Duration,
}

macro_rules! method {
    ($func_name:ident, $method:ident, [$($before:literal),*], id, [$($after:literal),*], $query:expr, $response_ty:ty) => {
        pub async fn $func_name(&self, test_id: &str) -> anyhow::Result<$response_ty> {
            self.request_with_json_response(
                reqwest::Method::$method,
                self.test_url(&[$($before),*], test_id, &[$($after),*], $query)?,
                &(),
            )
            .await
        }
    };

    ($func_name:ident, POST, $path:literal, $request_ty:ty, $response_ty:ty) => {
        pub async fn $func_name(&self, params: &$request_ty) -> anyhow::Result<$response_ty> {
            self.request_with_json_response(
                reqwest::Method::POST,
                self.endpoint.join($path)?,
                params,
            )
            .await
        }
    };
}

impl PlacementApiClient {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client_builder(&self) -> reqwest::ClientBuilder {
        reqwest::Client::builder().timeout(self.timeout)
    }

    method!(
        start_test,
        POST,
        "/api/test",
        StartTestV1Request,
        StartTestV1Response
    );

    method!(
        confirm_test,
        POST,
        ["api", "test"],
        id,
        ["confirm"],
        None,
        ConfirmTestV1Response
    );

    method!(
        check_test,
        POST,
        ["api", "check"],
        id,
        [],
        None,
        ReportV1Response
    );

    method!(
        begin_check,
        POST,
        ["api", "check"],
        id,
        [],
        Some("wait=false"),
        CheckStatusV1Response
    );

    method!(
        check_status,
        GET,
        ["api", "check"],
        id,
        ["status"],
        None,
        CheckStatusV1Response
    );

    method!(
        get_report,
        GET,
        ["api", "report"],
        id,
        [],
        None,
        ReportV1Response
    );

    /// Build the url for a per-test endpoint. The id is pushed as a
    /// single path segment so that any reserved characters in it are
    /// percent encoded rather than changing the path or query.
    fn test_url(
        &self,
        before: &[&str],
        test_id: &str,
        after: &[&str],
        query: Option<&str>,
    ) -> anyhow::Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("{} cannot be used as an api endpoint", self.endpoint))?
            .clear()
            .extend(before)
            .push(test_id)
            .extend(after);
        url.set_query(query);
        Ok(url)
    }

    pub async fn admin_set_diagnostic_log_filter_v1(
        &self,
        params: &SetDiagnosticFilterRequest,
    ) -> anyhow::Result<()> {
        let response = self
            .client_builder()
            .build()?
            .post(self.endpoint.join("/api/admin/set_diagnostic_log_filter/v1")?)
            .json(params)
            .send()
            .await?;
        error_for_status(response).await?;
        Ok(())
    }

    pub async fn request_with_json_response<
        T: reqwest::IntoUrl,
        B: serde::Serialize,
        R: serde::de::DeserializeOwned,
    >(
        &self,
        method: reqwest::Method,
        url: T,
        body: &B,
    ) -> anyhow::Result<R> {
        let response = self
            .client_builder()
            .build()?
            .request(method, url)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let response = error_for_status(response).await?;
        json_body(response).await.with_context(|| {
            format!(
                "request status {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
        })
    }
}

/// Turn a non-success response into an `ApiError`
async fn error_for_status(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body_bytes = response.bytes().await.with_context(|| {
        format!(
            "request status {}: {}, and failed to read response body",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
    })?;
    let error = match serde_json::from_slice::<ErrorResponse>(&body_bytes) {
        Ok(body) => body.error,
        Err(_) => String::from_utf8_lossy(&body_bytes).to_string(),
    };
    Err(ApiError {
        status: status.as_u16(),
        error,
    }
    .into())
}

pub async fn json_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> anyhow::Result<T> {
    let data = response.bytes().await.context("reading response body")?;
    serde_json::from_slice(&data).with_context(|| {
        format!(
            "parsing response as json: {}",
            String::from_utf8_lossy(&data)
        )
    })
}
