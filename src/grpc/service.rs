//! Admission service implementation.

use chrono::Utc;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::{
    admission_service_server::AdmissionService, BlockIdentityRequest, BlockIdentityResponse,
    EvaluateRequest, EvaluateResponse, GetConfigRequest, GetConfigResponse, Header,
    Identity as ProtoIdentity, ReloadRulesRequest, ReloadRulesResponse, ResetIdentityRequest,
    ResetIdentityResponse, StatusRequest, StatusResponse, UnblockIdentityRequest,
    UnblockIdentityResponse,
};
use crate::ratelimit::{AdmissionEngine, Identity, RulesConfig, Verdict};

/// Implementation of the `AdmissionService` gRPC interface.
pub struct AdmissionServiceImpl {
    /// The engine instance
    engine: Arc<AdmissionEngine>,
    /// Rule file re-read when `ReloadRules` carries no document
    rules_path: PathBuf,
}

impl AdmissionServiceImpl {
    pub fn new(engine: Arc<AdmissionEngine>, rules_path: PathBuf) -> Self {
        Self { engine, rules_path }
    }
}

/// Convert a wire identity. The address is mandatory; empty strings mean
/// absent for the other fields.
fn parse_identity(identity: Option<ProtoIdentity>) -> Result<Identity, Status> {
    let identity = identity.ok_or_else(|| Status::invalid_argument("identity is required"))?;

    if identity.ip.is_empty() {
        return Err(Status::invalid_argument("identity.ip is required"));
    }
    let ip: IpAddr = identity
        .ip
        .parse()
        .map_err(|_| Status::invalid_argument(format!("invalid ip address: {}", identity.ip)))?;

    let mut parsed = Identity::anonymous(ip);
    if !identity.user_id.is_empty() {
        parsed = parsed.with_user(identity.user_id);
    }
    if !identity.role.is_empty() {
        parsed = parsed.with_role(identity.role);
    }
    Ok(parsed)
}

fn to_response(verdict: &Verdict) -> EvaluateResponse {
    EvaluateResponse {
        allowed: verdict.allowed,
        limit: verdict.limit,
        remaining: verdict.remaining,
        reset_at: verdict.reset_at.timestamp(),
        retry_after_ms: verdict
            .retry_after
            .map_or(0, |retry_after| retry_after.as_millis() as u64),
        matched_rule: verdict.matched_rule.clone(),
        http_status: u32::from(verdict.http_status()),
        headers: verdict
            .headers()
            .into_iter()
            .map(|(name, value)| Header {
                name: name.to_string(),
                value,
            })
            .collect(),
    }
}

fn endpoint_class(class: &str) -> Option<&str> {
    if class.is_empty() {
        None
    } else {
        Some(class)
    }
}

#[tonic::async_trait]
impl AdmissionService for AdmissionServiceImpl {
    /// Decide whether a request may proceed.
    #[instrument(
        skip(self, request),
        fields(endpoint_class = %request.get_ref().endpoint_class)
    )]
    async fn evaluate(
        &self,
        request: Request<EvaluateRequest>,
    ) -> Result<Response<EvaluateResponse>, Status> {
        let req = request.into_inner();
        let identity = parse_identity(req.identity)?;

        let verdict = self
            .engine
            .evaluate(&identity, endpoint_class(&req.endpoint_class), Utc::now())
            .await;

        debug!(
            identity = %identity,
            allowed = verdict.allowed,
            rule = %verdict.matched_rule,
            "Admission decision made"
        );

        Ok(Response::new(to_response(&verdict)))
    }

    #[instrument(skip(self, request))]
    async fn quota(
        &self,
        request: Request<EvaluateRequest>,
    ) -> Result<Response<EvaluateResponse>, Status> {
        let req = request.into_inner();
        let identity = parse_identity(req.identity)?;

        let verdict = self
            .engine
            .quota(&identity, endpoint_class(&req.endpoint_class), Utc::now())
            .await;

        Ok(Response::new(to_response(&verdict)))
    }

    #[instrument(skip(self, _request))]
    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let status = self.engine.status();

        Ok(Response::new(StatusResponse {
            backend_state: status.backend.state.to_string(),
            consecutive_failures: status.backend.consecutive_failures,
            tracked_penalties: status.tracked_penalties as u64,
            escalated_identities: status.escalated_identities as u64,
            blocked_identities: status.blocked_identities as u64,
            rule_count: status.rule_count as u64,
            rules_generation: status.rules_generation,
            failure_mode: status.backend.mode.as_str().to_string(),
        }))
    }

    #[instrument(skip(self, request))]
    async fn reset_identity(
        &self,
        request: Request<ResetIdentityRequest>,
    ) -> Result<Response<ResetIdentityResponse>, Status> {
        let identity = parse_identity(request.into_inner().identity)?;

        let report = self
            .engine
            .reset_identity(&identity, Utc::now())
            .await
            .map_err(|e| {
                warn!(identity = %identity, error = %e, "Identity reset failed");
                Status::unavailable(e.to_string())
            })?;

        Ok(Response::new(ResetIdentityResponse {
            counters_reset: report.counters_reset as u64,
            penalty_cleared: report.penalty_cleared,
        }))
    }

    #[instrument(skip(self, request))]
    async fn block_identity(
        &self,
        request: Request<BlockIdentityRequest>,
    ) -> Result<Response<BlockIdentityResponse>, Status> {
        let req = request.into_inner();
        let identity = parse_identity(req.identity)?;
        if req.duration_secs == 0 {
            return Err(Status::invalid_argument("duration_secs must be positive"));
        }

        let until = self.engine.block_identity(
            &identity,
            Duration::from_secs(req.duration_secs),
            Utc::now(),
        );

        Ok(Response::new(BlockIdentityResponse {
            blocked_until: until.timestamp(),
        }))
    }

    #[instrument(skip(self, request))]
    async fn unblock_identity(
        &self,
        request: Request<UnblockIdentityRequest>,
    ) -> Result<Response<UnblockIdentityResponse>, Status> {
        let identity = parse_identity(request.into_inner().identity)?;
        let removed = self.engine.unblock_identity(&identity);
        Ok(Response::new(UnblockIdentityResponse { removed }))
    }

    #[instrument(skip(self, _request))]
    async fn get_config(
        &self,
        _request: Request<GetConfigRequest>,
    ) -> Result<Response<GetConfigResponse>, Status> {
        let config_json = serde_json::to_string(&self.engine.get_config())
            .map_err(|e| Status::internal(format!("failed to encode configuration: {}", e)))?;
        Ok(Response::new(GetConfigResponse { config_json }))
    }

    /// Replace the rule table. An empty document re-reads the rule file.
    #[instrument(skip(self, request))]
    async fn reload_rules(
        &self,
        request: Request<ReloadRulesRequest>,
    ) -> Result<Response<ReloadRulesResponse>, Status> {
        let mut yaml = request.into_inner().rules_yaml;
        if yaml.trim().is_empty() {
            yaml = tokio::fs::read_to_string(&self.rules_path).await.map_err(|e| {
                Status::failed_precondition(format!(
                    "failed to read {}: {}",
                    self.rules_path.display(),
                    e
                ))
            })?;
        }

        let rules =
            RulesConfig::from_yaml(&yaml).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let generation = self
            .engine
            .reload_rules(rules)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let rule_count = self.engine.status().rule_count as u64;
        info!(generation = generation, rules = rule_count, "Rules reloaded over gRPC");

        Ok(Response::new(ReloadRulesResponse {
            generation,
            rule_count,
        }))
    }
}
