use crate::config::{AuthKind, McpConfig, ResponseMode};
use crate::jsonrpc::{self, Incoming, RequestId, Response, RpcError};
use crate::session::{Session, SessionTable};
use grout::{logging, time};
use hashbrown::HashMap;
use mortar::http::engine::{EngineCtx, Housekeeper};
use mortar::http::response;
use mortar::http::router::Router;
use mortar::http::sse::SseEvent;
use mortar::http::types::{Method, Status};
use mortar::net::reactor::{ChunkProducer, Ops};
use mortar::{HttpRequest, HttpResponse};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Instant;

/// Context handed to method handlers. Notifications queued here are
/// appended to the session's event log and pushed to its SSE subscriber
/// once the handler returns.
pub struct MethodCtx<'a> {
    pub session_id: Option<&'a str>,
    pub principal: Option<&'a str>,
    notifications: Vec<(String, Value)>,
}

impl<'a> MethodCtx<'a> {
    pub fn notify(&mut self, method: &str, params: Value) {
        self.notifications.push((method.to_string(), params));
    }
}

pub type MethodHandler = Box<dyn Fn(&mut MethodCtx, Option<&Value>) -> Result<Value, RpcError>>;

/// JSON-RPC 2.0 dispatcher carrying the Model Context Protocol over
/// HTTP + SSE. Runs inline on the reactor thread so the session table and
/// event logs never need locking.
pub struct Dispatcher {
    config: McpConfig,
    methods: HashMap<String, MethodHandler>,
    sessions: RefCell<SessionTable>,
    log: logging::Logger,
}

impl Dispatcher {
    pub fn new(config: McpConfig, log: logging::Logger) -> Dispatcher {
        let sessions = SessionTable::new(
            config.session_timeout_seconds,
            config.max_sessions,
            config.sse_history_window_millis,
            config.sse_max_events,
            log.new(logging::o!()),
        );

        let mut dispatcher = Dispatcher {
            config,
            methods: HashMap::new(),
            sessions: RefCell::new(sessions),
            log,
        };

        dispatcher.register("ping", |_, _| Ok(json!({})));
        dispatcher
    }

    #[inline]
    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    #[inline]
    pub fn session_count(&self) -> usize {
        self.sessions.borrow().len()
    }

    /// Registers a method handler. Registration order is irrelevant;
    /// dispatch is by exact method name.
    pub fn register<F>(&mut self, method: &str, handler: F)
    where
        F: Fn(&mut MethodCtx, Option<&Value>) -> Result<Value, RpcError> + 'static,
    {
        self.methods.insert(method.to_string(), Box::new(handler));
    }

    /// Mounts the endpoint on the router. POST carries JSON-RPC, GET opens
    /// the SSE channel, DELETE ends the session, and OPTIONS preflight is
    /// answered here rather than by the router's synthesis.
    pub fn install(self: Rc<Self>, router: &mut Router) {
        let endpoint = self.config.endpoint.clone();
        let protect = self.config.auth.kind != AuthKind::None;

        let this = Rc::clone(&self);
        router
            .route_inline(Method::Post, &endpoint, move |request, ctx| {
                this.handle_post(request, ctx)
            })
            .protected = protect;

        let this = Rc::clone(&self);
        router
            .route_inline(Method::Get, &endpoint, move |request, ctx| {
                this.handle_get(request, ctx)
            })
            .protected = protect;

        let this = Rc::clone(&self);
        router
            .route_inline(Method::Delete, &endpoint, move |request, ctx| {
                this.handle_delete(request, ctx)
            })
            .protected = protect;

        let this = self;
        router.route_inline(Method::Options, &endpoint, move |request, _| {
            this.handle_preflight(request)
        });
    }

    pub fn handle_post(&self, request: &HttpRequest, ctx: &mut EngineCtx) -> HttpResponse {
        if request.body.len() > self.config.max_message_size {
            return self.with_cors(HttpResponse::text(
                Status::PAYLOAD_TOO_LARGE,
                "message too large",
            ));
        }

        match jsonrpc::parse(&request.body) {
            Err(error) => {
                logging::debug!(self.log, "unparseable message";
                                "context" => "post",
                                "code" => error.code);

                self.respond(Response::error(RequestId::Null, error), None)
            }
            Ok(Incoming::Notification { method, params }) => {
                self.handle_notification(request, &method, params.as_ref(), ctx)
            }
            Ok(Incoming::Call { id, method, params }) => {
                self.handle_call(request, id, &method, params.as_ref(), ctx)
            }
        }
    }

    fn handle_notification(
        &self,
        request: &HttpRequest,
        method: &str,
        params: Option<&Value>,
        ctx: &mut EngineCtx,
    ) -> HttpResponse {
        let now_secs = time::timestamp_secs();
        let session_id = {
            let mut sessions = self.sessions.borrow_mut();

            request
                .header("mcp-session-id")
                .and_then(|id| sessions.get(id, now_secs))
                .map(|session| session.id.clone())
        };

        let mut mctx = MethodCtx {
            session_id: session_id.as_deref(),
            principal: request.principal.as_deref(),
            notifications: Vec::new(),
        };

        if let Some(handler) = self.methods.get(method) {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&mut mctx, params)));

            if let Ok(Err(error)) = &result {
                logging::debug!(self.log, "notification handler failed";
                                "context" => "post",
                                "method" => method,
                                "code" => error.code);
            }
        }

        let queued = std::mem::take(&mut mctx.notifications);

        drop(mctx);
        self.flush_notifications(session_id.as_deref(), queued, now_secs, ctx);

        self.with_cors(HttpResponse::new(Status::ACCEPTED))
    }

    fn handle_call(
        &self,
        request: &HttpRequest,
        id: RequestId,
        method: &str,
        params: Option<&Value>,
        ctx: &mut EngineCtx,
    ) -> HttpResponse {
        let now_secs = time::timestamp_secs();

        let session_id = if method == "initialize" {
            let mut sessions = self.sessions.borrow_mut();

            match sessions.create(now_secs) {
                Some(session) => Some(session.id.clone()),
                None => {
                    return self.with_cors(HttpResponse::text(
                        Status::SERVICE_UNAVAILABLE,
                        "session table full",
                    ));
                }
            }
        } else {
            match request.header("mcp-session-id") {
                Some(id) => {
                    let mut sessions = self.sessions.borrow_mut();

                    match sessions.get(id, now_secs) {
                        Some(session) => Some(session.id.clone()),
                        None => {
                            return self
                                .with_cors(HttpResponse::text(Status::NOT_FOUND, "unknown session"));
                        }
                    }
                }
                None => None,
            }
        };

        let mut mctx = MethodCtx {
            session_id: session_id.as_deref(),
            principal: request.principal.as_deref(),
            notifications: Vec::new(),
        };

        let outcome = match self.methods.get(method) {
            Some(handler) => {
                match catch_unwind(AssertUnwindSafe(|| handler(&mut mctx, params))) {
                    Ok(result) => result,
                    Err(_) => {
                        logging::error!(self.log, "method handler panicked";
                                        "context" => "post",
                                        "method" => method);

                        Err(RpcError::internal("handler panicked"))
                    }
                }
            }
            None if method == "initialize" => Ok(default_initialize_result()),
            None => Err(RpcError::method_not_found(method)),
        };

        logging::debug!(self.log, "dispatched";
                        "context" => "post",
                        "method" => method,
                        "session" => session_id.as_deref().unwrap_or("-"),
                        "ok" => outcome.is_ok());

        let queued = std::mem::take(&mut mctx.notifications);

        drop(mctx);
        self.flush_notifications(session_id.as_deref(), queued, now_secs, ctx);

        let response = match outcome {
            Ok(result) => Response::result(id, result),
            Err(error) => Response::error(id, error),
        };

        self.respond(response, session_id.as_deref())
    }

    /// Opens the session's SSE channel. With resumability enabled and a
    /// `Last-Event-ID`, retained newer events are replayed ahead of live
    /// traffic.
    pub fn handle_get(&self, request: &HttpRequest, ctx: &mut EngineCtx) -> HttpResponse {
        let now_secs = time::timestamp_secs();
        let now_millis = time::timestamp_millis();
        let mut sessions = self.sessions.borrow_mut();

        let session = match request
            .header("mcp-session-id")
            .and_then(|id| sessions.get(id, now_secs))
        {
            Some(session) => session,
            None => {
                return self
                    .with_cors(HttpResponse::text(Status::BAD_REQUEST, "session required"));
            }
        };

        let mut preamble = Vec::new();

        if self.config.enable_resumability {
            if let Some(last) = request
                .header("last-event-id")
                .and_then(|value| value.trim().parse::<u64>().ok())
            {
                for record in session.log.replay_after(last, now_millis) {
                    preamble
                        .extend_from_slice(&SseEvent::data(&record.payload).with_id(record.id).serialize());
                }
            }
        }

        session.subscriber = Some(ctx.handle());

        logging::info!(self.log, "sse channel opened";
                       "context" => "get",
                       "session" => session.id.as_str(),
                       "replayed_bytes" => preamble.len());

        self.with_cors(HttpResponse::sse(preamble))
    }

    /// DELETE with a session header tears the session down.
    pub fn handle_delete(&self, request: &HttpRequest, ctx: &mut EngineCtx) -> HttpResponse {
        let removed = request
            .header("mcp-session-id")
            .and_then(|id| self.sessions.borrow_mut().remove(id));

        match removed {
            Some(session) => {
                if let Some(handle) = session.subscriber {
                    ctx.close(handle);
                }

                self.with_cors(HttpResponse::new(Status::NO_CONTENT))
            }
            None => self.with_cors(HttpResponse::text(Status::NOT_FOUND, "unknown session")),
        }
    }

    /// CORS preflight for the endpoint, answered by the dispatcher itself.
    pub fn handle_preflight(&self, _request: &HttpRequest) -> HttpResponse {
        let response = HttpResponse::new(Status::NO_CONTENT)
            .with_header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
            .with_header(
                "Access-Control-Allow-Headers",
                "Content-Type, Authorization, Mcp-Session-Id, Last-Event-ID, X-API-Key",
            )
            .with_header("Access-Control-Max-Age", "86400");

        self.with_cors(response)
    }

    fn flush_notifications(
        &self,
        session_id: Option<&str>,
        queued: Vec<(String, Value)>,
        now_secs: u64,
        ctx: &mut EngineCtx,
    ) {
        let session_id = match session_id {
            Some(id) => id,
            None => return,
        };

        if queued.is_empty() {
            return;
        }

        let mut sessions = self.sessions.borrow_mut();

        if let Some(session) = sessions.get(session_id, now_secs) {
            for (method, params) in queued {
                emit(session, &method, params, ctx);
            }
        }
    }

    fn respond(&self, response: Response, session_id: Option<&str>) -> HttpResponse {
        let body = response.to_json();

        let mut http = match self.config.response_mode {
            ResponseMode::Batch => HttpResponse::json(Status::OK, body),
            ResponseMode::Stream => {
                let mut pending = vec![SseEvent::data(&body).serialize()];
                let producer: ChunkProducer = Box::new(move || pending.pop());

                HttpResponse::stream("text/event-stream", producer)
            }
        };

        if let Some(id) = session_id {
            http.headers.set("Mcp-Session-Id", id);
        }

        self.with_cors(http)
    }

    fn with_cors(&self, mut response: HttpResponse) -> HttpResponse {
        if let Some(origin) = &self.config.cors_origin {
            response.headers.set("Access-Control-Allow-Origin", origin);
            response
                .headers
                .set("Access-Control-Expose-Headers", "Mcp-Session-Id");
        }

        response
    }
}

/// Appends a notification to the session log and forwards it to the live
/// SSE subscriber, chunk-framed for the open response.
fn emit(session: &mut Session, method: &str, params: Value, ctx: &mut EngineCtx) {
    let payload = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
    .to_string();

    let event_id = session.log.append(payload.clone(), time::timestamp_millis());

    if let Some(handle) = session.subscriber {
        let event = SseEvent::data(&payload).with_id(event_id).serialize();

        ctx.push(handle, response::encode_chunk(&event));
    }
}

fn default_initialize_result() -> Value {
    json!({
        "serverInfo": {
            "name": "keystone",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {},
    })
}

impl Housekeeper for Dispatcher {
    /// Session idle sweep, driven by the acceptor's housekeeping tick.
    fn tick(&self, _now: Instant, ops: &mut Ops) {
        let dropped = self.sessions.borrow_mut().sweep(time::timestamp_secs());

        for handle in dropped {
            ops.close(handle);
        }
    }
}
