// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! gRPC transport implementing the `AgentBroker` service defined in
//! `aviary.v1`. Thin shims only: authentication, proto conversion, and the
//! bridge from the dispatch stream loop to a tonic response stream.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::dispatch::{
    Dispatch, RequestContext, StartSessionRequest, StreamEventsRequest,
};
use crate::event::SessionEvent;
use crate::provider::ProviderHealth;
use crate::session::SessionRecord;

use super::auth::{bearer_token, TokenVerifier};

/// Generated protobuf types for the `aviary.v1` package.
pub mod proto {
    tonic::include_proto!("aviary.v1");
}

pub type GrpcStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

// ---------------------------------------------------------------------------
// Type conversions: domain → proto
// ---------------------------------------------------------------------------

pub fn session_to_proto(record: &SessionRecord) -> proto::Session {
    proto::Session {
        session_id: record.session_id.clone(),
        project_id: record.project_id.clone(),
        provider_id: record.provider_id.clone(),
        repo_path: record.repo_path.display().to_string(),
        state: record.state.as_str().to_owned(),
        created_at_ms: record.created_at_ms as i64,
        stopped_at_ms: record.stopped_at_ms.unwrap_or(0) as i64,
        last_error: record.last_error.clone().unwrap_or_default(),
    }
}

pub fn event_to_proto(event: &SessionEvent) -> proto::Event {
    proto::Event {
        seq: event.seq,
        timestamp_ms: event.timestamp_ms as i64,
        session_id: event.session_id.clone(),
        project_id: event.project_id.clone(),
        provider_id: event.provider_id.clone(),
        r#type: event.kind.as_str().to_owned(),
        stream: event.stream.as_str().to_owned(),
        text: event.text.clone(),
        done: event.done,
        error: event.error.clone().unwrap_or_default(),
    }
}

pub fn provider_health_to_proto(health: &ProviderHealth) -> proto::ProviderHealth {
    proto::ProviderHealth {
        provider_id: health.provider_id.clone(),
        available: health.available,
        detail: health.detail.clone().unwrap_or_default(),
        version: health.version.clone().unwrap_or_default(),
    }
}

/// The gRPC service: authenticates each call and delegates to the
/// dispatch facade.
pub struct BrokerService {
    dispatch: Arc<Dispatch>,
    verifier: Arc<dyn TokenVerifier>,
    shutdown: CancellationToken,
}

impl BrokerService {
    pub fn new(
        dispatch: Arc<Dispatch>,
        verifier: Arc<dyn TokenVerifier>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { dispatch, verifier, shutdown }
    }

    /// Build the request context from metadata. All operations except
    /// GetHealth require a verified bearer token.
    fn context<T>(&self, request: &Request<T>) -> Result<RequestContext, Status> {
        let token = bearer_token(request.metadata()).map_err(|e| e.to_grpc_status())?;
        let claims = self.verifier.verify(token).map_err(|e| e.to_grpc_status())?;
        let peer = request.remote_addr().map(|addr| addr.to_string());
        Ok(RequestContext { peer, claims: Some(claims) })
    }
}

#[tonic::async_trait]
impl proto::agent_broker_server::AgentBroker for BrokerService {
    async fn start_session(
        &self,
        request: Request<proto::StartSessionRequest>,
    ) -> Result<Response<proto::StartSessionResponse>, Status> {
        let ctx = self.context(&request)?;
        let req = request.into_inner();
        let record = self
            .dispatch
            .start_session(
                &ctx,
                StartSessionRequest {
                    project_id: req.project_id,
                    session_id: req.session_id,
                    repo_path: req.repo_path,
                    provider_id: req.provider_id,
                    agent_opts: req.agent_opts,
                },
            )
            .await?;
        Ok(Response::new(proto::StartSessionResponse {
            session_id: record.session_id,
            state: record.state.as_str().to_owned(),
            created_at_ms: record.created_at_ms as i64,
        }))
    }

    async fn stop_session(
        &self,
        request: Request<proto::StopSessionRequest>,
    ) -> Result<Response<proto::StopSessionResponse>, Status> {
        let ctx = self.context(&request)?;
        let req = request.into_inner();
        let record = self.dispatch.stop_session(&ctx, &req.session_id, req.force).await?;
        Ok(Response::new(proto::StopSessionResponse {
            state: record.state.as_str().to_owned(),
        }))
    }

    async fn get_session(
        &self,
        request: Request<proto::GetSessionRequest>,
    ) -> Result<Response<proto::GetSessionResponse>, Status> {
        let ctx = self.context(&request)?;
        let req = request.into_inner();
        let record = self.dispatch.get_session(&ctx, &req.session_id).await?;
        Ok(Response::new(proto::GetSessionResponse {
            session: Some(session_to_proto(&record)),
        }))
    }

    async fn list_sessions(
        &self,
        request: Request<proto::ListSessionsRequest>,
    ) -> Result<Response<proto::ListSessionsResponse>, Status> {
        let ctx = self.context(&request)?;
        let req = request.into_inner();
        let filter = if req.project_id.is_empty() { None } else { Some(req.project_id.as_str()) };
        let records = self.dispatch.list_sessions(&ctx, filter).await?;
        Ok(Response::new(proto::ListSessionsResponse {
            sessions: records.iter().map(session_to_proto).collect(),
        }))
    }

    async fn send_input(
        &self,
        request: Request<proto::SendInputRequest>,
    ) -> Result<Response<proto::SendInputResponse>, Status> {
        let ctx = self.context(&request)?;
        let req = request.into_inner();
        let seq = self.dispatch.send_input(&ctx, &req.session_id, &req.text).await?;
        Ok(Response::new(proto::SendInputResponse { accepted: true, seq }))
    }

    async fn purge_session(
        &self,
        request: Request<proto::PurgeSessionRequest>,
    ) -> Result<Response<proto::PurgeSessionResponse>, Status> {
        let ctx = self.context(&request)?;
        let req = request.into_inner();
        self.dispatch.purge_session(&ctx, &req.session_id).await?;
        Ok(Response::new(proto::PurgeSessionResponse { purged: true }))
    }

    type StreamEventsStream = GrpcStream<proto::Event>;

    async fn stream_events(
        &self,
        request: Request<proto::StreamEventsRequest>,
    ) -> Result<Response<Self::StreamEventsStream>, Status> {
        let ctx = self.context(&request)?;
        let req = request.into_inner();
        let stream_req = StreamEventsRequest {
            session_id: req.session_id,
            subscriber_id: if req.subscriber_id.is_empty() { None } else { Some(req.subscriber_id) },
            after_seq: req.after_seq,
        };

        let dispatch = Arc::clone(&self.dispatch);
        let cancel = self.shutdown.child_token();
        let (out_tx, out_rx) = mpsc::channel::<Result<proto::Event, Status>>(64);

        tokio::spawn(async move {
            let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(64);
            let forward_tx = out_tx.clone();
            let forward_cancel = cancel.clone();
            let forward = async move {
                while let Some(event) = event_rx.recv().await {
                    if forward_tx.send(Ok(event_to_proto(&event))).await.is_err() {
                        // Client went away; release the dispatch loop.
                        forward_cancel.cancel();
                        break;
                    }
                }
            };

            let (result, ()) =
                tokio::join!(dispatch.stream_events(&ctx, stream_req, cancel.clone(), event_tx), forward);
            if let Err(e) = result {
                let _ = out_tx.send(Err(e.to_grpc_status())).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }

    async fn get_health(
        &self,
        _request: Request<proto::GetHealthRequest>,
    ) -> Result<Response<proto::GetHealthResponse>, Status> {
        // Health bypasses the token check.
        let report = self.dispatch.health().await;
        Ok(Response::new(proto::GetHealthResponse {
            status: report.status,
            uptime_secs: report.uptime_secs,
            active_sessions: report.active_sessions as u32,
            providers: report.providers.iter().map(provider_health_to_proto).collect(),
        }))
    }

    async fn list_providers(
        &self,
        request: Request<proto::ListProvidersRequest>,
    ) -> Result<Response<proto::ListProvidersResponse>, Status> {
        let ctx = self.context(&request)?;
        let providers = self.dispatch.list_providers(&ctx).await?;
        Ok(Response::new(proto::ListProvidersResponse {
            providers: providers.iter().map(provider_health_to_proto).collect(),
        }))
    }
}

#[cfg(test)]
#[path = "grpc_tests.rs"]
mod tests;
