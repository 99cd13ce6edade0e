//! Transport-agnostic request dispatcher for the sweep endpoints.
//!
//! An HTTP server embeds [`SweepApi`] and forwards method, path and body;
//! nothing here opens sockets.

pub mod error;
pub mod request;
pub mod response;

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::TunerConfig;
use crate::tune::TuningService;

pub use error::{ApiError, ApiResult};
pub use request::{AutoSweepRequest, ParamRequest};
pub use response::{flatten_recommendation, ComboView, RoundResult, StatusResponse};

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn json<T: Serialize>(status: u16, body: &T) -> ApiResult<Self> {
        Ok(Self {
            status,
            body: serde_json::to_value(body).map_err(ApiError::Encode)?,
        })
    }

    fn error(err: &ApiError) -> Self {
        Self {
            status: err.status_code(),
            body: json!({ "error": err.to_string() }),
        }
    }
}

/// Routes the sweep endpoints of one target to a [`TuningService`].
///
/// Start requests spawn the session on the ambient tokio runtime, so
/// [`SweepApi::handle`] must be called from within one.
#[derive(Clone)]
pub struct SweepApi {
    service: Arc<TuningService>,
    target: String,
    config: Arc<TunerConfig>,
}

impl SweepApi {
    pub fn new(
        service: Arc<TuningService>,
        target: impl Into<String>,
        config: TunerConfig,
    ) -> Self {
        Self {
            service,
            target: target.into(),
            config: Arc::new(config),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn handle(&self, method: &str, path: &str, body: &[u8]) -> ApiResponse {
        let route = normalize_path(path);
        let method = method.to_ascii_uppercase();
        debug!(
            target: "sweep.api",
            device = %self.target,
            method = %method,
            path = %route,
            "request"
        );
        let result = match (method.as_str(), route) {
            ("POST", "/sweep/auto") => self.start(body, false),
            ("POST", "/sweep/start") => self.start(body, true),
            ("GET", "/sweep/status") => self.status(),
            ("POST", "/sweep/stop") => self.stop(),
            (_, "/sweep/auto" | "/sweep/start" | "/sweep/status" | "/sweep/stop") => {
                Err(ApiError::MethodNotAllowed {
                    method: method.clone(),
                    path: route.to_string(),
                })
            }
            _ => Err(ApiError::NotFound {
                method: method.clone(),
                path: route.to_string(),
            }),
        };
        result.unwrap_or_else(|err| {
            if err.status_code() >= 500 {
                warn!(target: "sweep.api", device = %self.target, error = %err, "request failed");
            } else {
                debug!(
                    target: "sweep.api",
                    device = %self.target,
                    error = %err,
                    "request rejected"
                );
            }
            ApiResponse::error(&err)
        })
    }

    fn start(&self, body: &[u8], single_pass: bool) -> ApiResult<ApiResponse> {
        let wire: AutoSweepRequest = serde_json::from_slice(body)?;
        let request = wire.into_request(&self.config)?;
        let session_id = if single_pass {
            self.service.start_sweep(&self.target, request)?
        } else {
            self.service.start_auto(&self.target, request)?
        };
        ApiResponse::json(
            202,
            &json!({
                "status": "started",
                "mode": if single_pass { "sweep" } else { "auto" },
                "session_id": session_id,
            }),
        )
    }

    fn status(&self) -> ApiResult<ApiResponse> {
        let snapshot = self.service.status(&self.target)?;
        ApiResponse::json(200, &StatusResponse::from(&snapshot))
    }

    fn stop(&self) -> ApiResult<ApiResponse> {
        let stopped = self.service.cancel(&self.target)?;
        ApiResponse::json(200, &json!({ "stopped": stopped }))
    }
}

fn normalize_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or(path);
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::{
        Combination, EvalResult, PipelineEvaluator, SampleStats, ACCEPTANCE_RATE,
    };
    use crate::tune::TuneLimits;
    use async_trait::async_trait;

    struct FlatEvaluator;

    #[async_trait]
    impl PipelineEvaluator for FlatEvaluator {
        async fn reset(&self) -> EvalResult<()> {
            Ok(())
        }

        async fn apply_params(&self, _params: &Combination) -> EvalResult<()> {
            Ok(())
        }

        async fn sample_iteration(&self) -> EvalResult<SampleStats> {
            Ok([(ACCEPTANCE_RATE.to_string(), 0.4)].into_iter().collect())
        }
    }

    const BODY: &str = r#"{
        "params": [{"name": "noise_relative", "start": 0.01, "end": 0.1, "step": 0.01}],
        "iterations": 2, "settle_time": "1s", "interval": "100ms"
    }"#;

    fn api() -> SweepApi {
        let service = Arc::new(TuningService::new(TuneLimits::default()));
        service.register("lidar-0", Arc::new(FlatEvaluator));
        SweepApi::new(service, "lidar-0", TunerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn start_conflict_and_status() {
        let api = api();
        let idle = api.handle("GET", "/sweep/status", b"");
        assert_eq!(idle.status, 200);
        assert_eq!(idle.body["status"], "idle");

        let started = api.handle("POST", "/sweep/auto", BODY.as_bytes());
        assert_eq!(started.status, 202);
        let conflict = api.handle("POST", "/sweep/start", BODY.as_bytes());
        assert_eq!(conflict.status, 409);
        assert!(conflict.body["error"].is_string());

        let running = api.handle("get", "/sweep/status/", b"");
        assert_eq!(running.body["status"], "running");
        assert!(running.body["recommendation"].is_null());

        api.service.wait("lidar-0").await.unwrap();
        let done = api.handle("GET", "/sweep/status?verbose=1", b"");
        assert_eq!(done.body["status"], "complete");
        assert_eq!(done.body["mode"], "auto");
        assert_eq!(done.body["recommendation"]["score"], 0.4);
        assert!(done.body["round_results"].as_array().unwrap().len() >= 1);
    }

    #[tokio::test]
    async fn validation_errors_are_bad_requests() {
        let api = api();
        let negative = api.handle(
            "POST",
            "/sweep/auto",
            br#"{"params": [{"name": "a", "values": [1]}], "top_k": -2}"#,
        );
        assert_eq!(negative.status, 400);
        assert_eq!(api.handle("POST", "/sweep/auto", b"not json").status, 400);
        assert_eq!(
            api.handle("POST", "/sweep/auto", br#"{"params": []}"#).status,
            400
        );
        let too_few = api.handle(
            "POST",
            "/sweep/auto",
            br#"{"params": [{"name": "a", "start": 0, "end": 1, "step": 0.1}],
                "values_per_param": 1}"#,
        );
        assert_eq!(too_few.status, 400);
        assert_eq!(api.handle("GET", "/sweep/status", b"").body["status"], "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn wide_ranges_are_sampled_not_gridded() {
        let api = api();
        let wide = api.handle(
            "POST",
            "/sweep/auto",
            br#"{"params": [{"name": "a", "start": 0, "end": 1e30, "step": 0.001}]}"#,
        );
        assert_eq!(wide.status, 202, "{}", wide.body);
        api.service.wait("lidar-0").await.unwrap();

        let dense = api.handle(
            "POST",
            "/sweep/auto",
            br#"{"params": [{"name": "a", "start": 0, "end": 1e9, "step": 1}],
                "values_per_param": 30000000}"#,
        );
        assert_eq!(dense.status, 400);
        assert!(dense.body["error"].as_str().unwrap().contains("limit is 10000"));
    }

    #[test]
    fn encode_failures_are_server_errors() {
        let unencodable = std::collections::BTreeMap::from([((1u8, 2u8), 3u8)]);
        let err = ApiResponse::json(200, &unencodable).unwrap_err();
        assert!(matches!(err, ApiError::Encode(_)));
        assert_eq!(err.status_code(), 500);
        assert_eq!(ApiResponse::error(&err).status, 500);
    }

    #[tokio::test]
    async fn unknown_routes_and_methods() {
        let api = api();
        assert_eq!(api.handle("GET", "/sweep/other", b"").status, 404);
        assert_eq!(api.handle("DELETE", "/sweep/status", b"").status, 405);

        let stop = api.handle("POST", "/sweep/stop", b"");
        assert_eq!(stop.status, 200);
        assert_eq!(stop.body["stopped"], false);

        let service = Arc::new(TuningService::new(TuneLimits::default()));
        let orphan = SweepApi::new(service, "radar-9", TunerConfig::default());
        assert_eq!(orphan.handle("GET", "/sweep/status", b"").status, 404);
    }
}
