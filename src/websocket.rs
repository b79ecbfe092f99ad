//! # Device Conversation WebSocket
//!
//! Devices connect to `/ws/conversation` and talk to the assistant one
//! utterance at a time.
//!
//! ## WebSocket Protocol:
//! 1. **Handshake**: first text frame is `{"X-User-ID", "X-Device-ID", "X-Language"}`
//! 2. **Audio**: binary frames of raw PCM (16-bit, 16kHz, mono)
//! 3. **End of utterance**: the text frame `EOS`
//! 4. **Reply**: emotion tag, message text and/or audio, per the reply profile
//! 5. **Keepalive**: `PING` is answered with `PONG` at any time
//!
//! ## Actor Model:
//! Each connection is an independent actor owning its [`ConversationSession`].
//! The pipeline runs inside `ctx.wait`, which suspends the inbound stream
//! until the reply is sent, so utterances on one connection never overlap.
//! Closing the socket drops the actor together with any in-flight pipeline run.

use crate::audio::session::{ConversationSession, Fragment, ServerFrame, SessionAction};
use crate::conversation::{ConversationPolicy, PipelineError, UtteranceOutcome, UtteranceRequest};
use crate::error::AppError;
use crate::state::AppState;

use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// One claimed slot under `max_concurrent_sessions`, released on drop.
///
/// Owned by the actor, so the slot is returned even if the upgrade response
/// is never polled and the actor never starts.
struct SessionSlot(web::Data<AppState>);

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.release_session();
    }
}

pub struct ConversationWebSocket {
    session: ConversationSession,
    state: web::Data<AppState>,
    /// Snapshotted at connect time; config updates apply to new connections.
    policy: ConversationPolicy,
    last_heartbeat: Instant,
    _slot: SessionSlot,
}

impl ConversationWebSocket {
    fn new(state: web::Data<AppState>, slot: SessionSlot) -> Self {
        let config = state.get_config();
        Self {
            session: ConversationSession::new(
                config.utterance_limits(),
                config.performance.max_utterance_bytes,
                config.reply_profile,
            ),
            policy: ConversationPolicy::from_config(&config),
            state,
            last_heartbeat: Instant::now(),
            _slot: slot,
        }
    }

    fn send(frame: ServerFrame, ctx: &mut ws::WebsocketContext<Self>) {
        match frame {
            ServerFrame::Text(text) => ctx.text(text),
            ServerFrame::Binary(bytes) => ctx.binary(bytes),
        }
    }

    fn apply(&mut self, action: SessionAction, ctx: &mut ws::WebsocketContext<Self>) {
        match action {
            SessionAction::None => {}
            SessionAction::Reply(frame) => Self::send(frame, ctx),
            SessionAction::Process(request) => self.process(request, ctx),
        }
    }

    /// Run the pipeline for one utterance and send the result.
    fn process(&mut self, request: UtteranceRequest, ctx: &mut ws::WebsocketContext<Self>) {
        let session_id = self.session.id();
        info!(
            %session_id,
            user_id = %request.user_id,
            device_id = request.device_id,
            bytes = request.pcm.len(),
            "Processing utterance"
        );

        let pipeline = self.state.pipeline.clone();
        let policy = self.policy.clone();
        let fut = async move { pipeline.process(request, &policy).await };

        ctx.wait(fut.into_actor(self).map(|result, act, ctx| {
            for frame in act.finish_utterance(result) {
                Self::send(frame, ctx);
            }
        }));
    }

    /// Record a pipeline result and return the frames owed to the device.
    fn finish_utterance(
        &mut self,
        result: Result<UtteranceOutcome, PipelineError>,
    ) -> Vec<ServerFrame> {
        // Pongs queued behind the pipeline run count as liveness.
        self.last_heartbeat = Instant::now();
        self.state.record_utterance(&result);
        if let Err(err) = &result {
            warn!(session_id = %self.session.id(), error = %err, "Utterance failed");
        }
        self.session.complete(&result)
    }

    /// Run an inbound-frame transition, counting rejections for metrics.
    fn step(
        &mut self,
        step: impl FnOnce(&mut ConversationSession) -> SessionAction,
    ) -> SessionAction {
        let rejected_before = self.session.summary().utterances_rejected;
        let action = step(&mut self.session);
        if self.session.summary().utterances_rejected > rejected_before {
            self.state.record_rejected_utterance();
        }
        action
    }

    fn handle_frame(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        step: impl FnOnce(&mut ConversationSession) -> SessionAction,
    ) {
        let action = self.step(step);
        self.apply(action, ctx);
    }
}

impl Actor for ConversationWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session.id(), "WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    session_id = %act.session.id(),
                    "WebSocket heartbeat timeout, closing connection"
                );
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let summary = self.session.summary();
        info!(
            session_id = %self.session.id(),
            duration_seconds = self.session.duration_seconds(),
            status = self.session.status().as_str(),
            total_audio_bytes = summary.total_audio_bytes,
            utterances_processed = summary.utterances_processed,
            utterances_rejected = summary.utterances_rejected,
            pipeline_failures = summary.pipeline_failures,
            "WebSocket connection stopped"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConversationWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_frame(ctx, |session| session.handle_text(&text));
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                debug!(session_id = %self.session.id(), bytes = data.len(), "PCM frame received");
                self.handle_frame(ctx, |session| session.handle_binary(&data));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session.id(), ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(item)) => {
                self.last_heartbeat = Instant::now();
                let fragment = match &item {
                    Item::FirstText(data) => Fragment::FirstText(data),
                    Item::FirstBinary(data) => Fragment::FirstBinary(data),
                    Item::Continue(data) => Fragment::Continue(data),
                    Item::Last(data) => Fragment::Last(data),
                };
                self.handle_frame(ctx, |session| session.handle_fragment(fragment));
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session.id(), error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// Refuses the upgrade with 503 once `max_concurrent_sessions` connections are open.
pub async fn conversation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let config = state.get_config();
    let max_sessions = config.performance.max_concurrent_sessions;

    if !state.try_acquire_session(max_sessions) {
        warn!(max_sessions, "Session limit reached, refusing WebSocket upgrade");
        return Err(AppError::ServiceUnavailable(format!(
            "maximum of {} concurrent sessions reached",
            max_sessions
        ))
        .into());
    }
    let slot = SessionSlot(state.clone());

    info!(peer = ?req.connection_info().peer_addr(), "New WebSocket connection request");

    ws::WsResponseBuilder::new(ConversationWebSocket::new(state, slot), &req, stream)
        .frame_size(config.performance.max_request_bytes)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::{HEADERS_ACCEPTED, PING, PONG};
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use uuid::Uuid;

    const USER: &str = "0b7c1f5e-54a4-4e55-9a4e-1f2f0a5c6d7e";

    fn connection(data: &web::Data<AppState>) -> ConversationWebSocket {
        assert!(data.try_acquire_session(10));
        ConversationWebSocket::new(data.clone(), SessionSlot(data.clone()))
    }

    /// Frames drive the session, the pipeline result comes back as reply
    /// frames and the slot is returned when the connection goes away.
    #[actix_web::test]
    async fn test_utterance_round_trip() {
        let (_dir, state) = test_state(AppConfig::default());
        state
            .pipeline
            .store()
            .seed_user(Uuid::parse_str(USER).unwrap(), Some("Mia"))
            .await;
        let data = web::Data::new(state);
        let mut conn = connection(&data);

        let handshake = format!(
            r#"{{"X-User-ID":"{}","X-Device-ID":"3","X-Language":"en"}}"#,
            USER
        );
        assert_eq!(
            conn.step(|s| s.handle_text(&handshake)),
            SessionAction::Reply(ServerFrame::Text(HEADERS_ACCEPTED.to_string()))
        );
        assert_eq!(conn.step(|s| s.handle_binary(&[0; 16_000])), SessionAction::None);
        let request = match conn.step(|s| s.handle_text("EOS")) {
            SessionAction::Process(request) => request,
            other => panic!("expected Process, got {:?}", other),
        };

        let result = data.pipeline.process(request, &conn.policy).await;
        let frames = conn.finish_utterance(result);
        assert_eq!(frames, vec![ServerFrame::Text("curiosity".to_string())]);
        assert_eq!(
            conn.step(|s| s.handle_text(PING)),
            SessionAction::Reply(ServerFrame::Text(PONG.to_string()))
        );

        let metrics = data.get_metrics_snapshot();
        assert_eq!(metrics.utterances_processed, 1);
        assert_eq!(metrics.active_sessions, 1);
        drop(conn);
        assert_eq!(data.get_metrics_snapshot().active_sessions, 0);
    }

    /// Rejected utterances and pipeline failures both reach the counters.
    #[actix_web::test]
    async fn test_rejections_and_failures_counted() {
        let (_dir, state) = test_state(AppConfig::default());
        let data = web::Data::new(state);
        let mut conn = connection(&data);

        conn.step(|s| {
            s.handle_text(&format!(
                r#"{{"X-User-ID":"{}","X-Device-ID":"3","X-Language":"en"}}"#,
                USER
            ))
        });
        conn.step(|s| s.handle_text("EOS"));
        assert_eq!(data.get_metrics_snapshot().rejected_utterances, 1);

        conn.step(|s| s.handle_binary(&[0; 16_000]));
        let request = match conn.step(|s| s.handle_text("EOS")) {
            SessionAction::Process(request) => request,
            other => panic!("expected Process, got {:?}", other),
        };
        // The user was never seeded.
        let result = data.pipeline.process(request, &conn.policy).await;
        let frames = conn.finish_utterance(result);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerFrame::Text(text) if text.starts_with("Processing error:")
        ));
        assert_eq!(data.get_metrics_snapshot().pipeline_failures, 1);
    }

    /// Upgrades past the cap are refused with 503.
    #[actix_web::test]
    async fn test_session_cap_refuses_upgrade() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let (_dir, state) = test_state(config);
        let data = web::Data::new(state);
        assert!(data.try_acquire_session(1));

        let app = test::init_service(
            App::new()
                .app_data(data.clone())
                .route("/ws/conversation", web::get().to(conversation_websocket)),
        )
        .await;
        let req = test::TestRequest::get().uri("/ws/conversation").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(data.get_metrics_snapshot().active_sessions, 1);
    }

    /// A failed handshake gives its slot back.
    #[actix_web::test]
    async fn test_failed_handshake_releases_slot() {
        let (_dir, state) = test_state(AppConfig::default());
        let data = web::Data::new(state);

        let app = test::init_service(
            App::new()
                .app_data(data.clone())
                .route("/ws/conversation", web::get().to(conversation_websocket)),
        )
        .await;
        let req = test::TestRequest::get().uri("/ws/conversation").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(data.get_metrics_snapshot().active_sessions, 0);
    }
}
