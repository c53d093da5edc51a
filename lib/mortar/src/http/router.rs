use crate::http::engine::EngineCtx;
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::http::types::Method;
use hashbrown::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Handler running on the reactor thread with engine access. Session-owning
/// endpoints (MCP) use this form.
pub type InlineHandler = Rc<dyn Fn(&HttpRequest, &mut EngineCtx) -> HttpResponse>;

/// Handler eligible for worker-pool execution.
pub type PooledHandler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

#[derive(Clone)]
pub enum RouteHandler {
    Inline(InlineHandler),
    Pooled(PooledHandler),
}

#[derive(Clone)]
pub struct Route {
    pub handler: RouteHandler,
    /// Protected routes require an authenticated principal.
    pub protected: bool,
}

pub enum RouteMatch<'a> {
    Found(&'a Route),
    /// The path exists but not under this method.
    MethodMissing(Vec<Method>),
    NotFound,
}

#[derive(Default)]
struct PathRoutes {
    by_method: Vec<(Method, Route)>,
    any: Option<Route>,
}

/// Exact-path dispatch table. Ties within a path break by insertion order;
/// a wildcard-method route is consulted after explicit methods.
#[derive(Default)]
pub struct Router {
    paths: HashMap<String, PathRoutes>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            paths: HashMap::new(),
        }
    }

    pub fn route<F>(&mut self, method: Method, path: &str, handler: F) -> &mut Route
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.add(
            Some(method),
            path,
            Route {
                handler: RouteHandler::Pooled(Arc::new(handler)),
                protected: false,
            },
        )
    }

    pub fn route_inline<F>(&mut self, method: Method, path: &str, handler: F) -> &mut Route
    where
        F: Fn(&HttpRequest, &mut EngineCtx) -> HttpResponse + 'static,
    {
        self.add(
            Some(method),
            path,
            Route {
                handler: RouteHandler::Inline(Rc::new(handler)),
                protected: false,
            },
        )
    }

    pub fn route_any<F>(&mut self, path: &str, handler: F) -> &mut Route
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.add(
            None,
            path,
            Route {
                handler: RouteHandler::Pooled(Arc::new(handler)),
                protected: false,
            },
        )
    }

    pub fn add(&mut self, method: Option<Method>, path: &str, route: Route) -> &mut Route {
        let entry = self.paths.entry(path.to_string()).or_default();

        match method {
            Some(method) => {
                entry.by_method.push((method, route));
                &mut entry.by_method.last_mut().expect("just pushed").1
            }
            None => {
                entry.any = Some(route);
                entry.any.as_mut().expect("just set")
            }
        }
    }

    /// Marks every handler registered at the path as protected.
    pub fn protect(&mut self, path: &str) {
        if let Some(entry) = self.paths.get_mut(path) {
            for (_, route) in entry.by_method.iter_mut() {
                route.protected = true;
            }

            if let Some(route) = entry.any.as_mut() {
                route.protected = true;
            }
        }
    }

    pub fn lookup(&self, method: Method, path: &str) -> RouteMatch {
        let entry = match self.paths.get(path) {
            Some(entry) => entry,
            None => return RouteMatch::NotFound,
        };

        let found = entry
            .by_method
            .iter()
            .find(|(registered, _)| *registered == method)
            .map(|(_, route)| route)
            .or(entry.any.as_ref());

        match found {
            Some(route) => RouteMatch::Found(route),
            None => RouteMatch::MethodMissing(self.allowed(path)),
        }
    }

    /// Methods answering at a path, for `Allow` headers.
    pub fn allowed(&self, path: &str) -> Vec<Method> {
        let entry = match self.paths.get(path) {
            Some(entry) => entry,
            None => return Vec::new(),
        };

        let mut methods: Vec<Method> = Vec::new();

        for (method, _) in entry.by_method.iter() {
            if !methods.contains(method) {
                methods.push(*method);
            }
        }

        if methods.is_empty() && entry.any.is_some() {
            methods.extend_from_slice(&Method::ALL);
        }

        methods
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }
}

/// Renders an `Allow` header value.
pub fn allow_header(methods: &[Method]) -> String {
    methods
        .iter()
        .map(|method| method.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::Status;

    fn stub(tag: &'static str) -> impl Fn(&HttpRequest) -> HttpResponse + Send + Sync {
        move |_| HttpResponse::text(Status::OK, tag)
    }

    fn body_of(route: &Route) -> &'static str {
        match &route.handler {
            RouteHandler::Pooled(_) => "pooled",
            RouteHandler::Inline(_) => "inline",
        }
    }

    #[test]
    fn test_lookup_by_method() {
        let mut router = Router::new();

        router.route(Method::Get, "/a", stub("get"));
        router.route(Method::Post, "/a", stub("post"));

        match router.lookup(Method::Get, "/a") {
            RouteMatch::Found(route) => assert_eq!(body_of(route), "pooled"),
            _ => panic!("expected match"),
        }

        match router.lookup(Method::Delete, "/a") {
            RouteMatch::MethodMissing(allowed) => {
                assert_eq!(allowed, vec![Method::Get, Method::Post])
            }
            _ => panic!("expected method mismatch"),
        }
    }

    #[test]
    fn test_not_found() {
        let router = Router::new();

        assert!(matches!(
            router.lookup(Method::Get, "/missing"),
            RouteMatch::NotFound
        ));
    }

    #[test]
    fn test_wildcard_method() {
        let mut router = Router::new();

        router.route_any("/any", stub("any"));

        assert!(matches!(
            router.lookup(Method::Patch, "/any"),
            RouteMatch::Found(_)
        ));
        assert_eq!(router.allowed("/any").len(), Method::ALL.len());
    }

    #[test]
    fn test_insertion_order_tie_break() {
        let mut router = Router::new();

        router.route(Method::Get, "/dup", stub("first"));
        router.route(Method::Get, "/dup", stub("second"));

        // First registration wins.
        match router.lookup(Method::Get, "/dup") {
            RouteMatch::Found(route) => {
                let response = match &route.handler {
                    RouteHandler::Pooled(handler) => handler(&crate::http::request::HttpRequest {
                        method: Method::Get,
                        target: "/dup".into(),
                        path: "/dup".into(),
                        version: crate::http::types::Version::Http11,
                        headers: Default::default(),
                        query: Default::default(),
                        body: Vec::new(),
                        peer: crate::net::addr::PeerAddress::Local,
                        forwarded: Default::default(),
                        principal: None,
                    }),
                    RouteHandler::Inline(_) => panic!("unexpected inline"),
                };

                match response.body {
                    crate::http::response::Body::Bytes(bytes) => assert_eq!(bytes, b"first"),
                    _ => panic!("unexpected body"),
                }
            }
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn test_protect() {
        let mut router = Router::new();

        router.route(Method::Post, "/secure", stub("x"));
        router.protect("/secure");

        match router.lookup(Method::Post, "/secure") {
            RouteMatch::Found(route) => assert!(route.protected),
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn test_allow_header_rendering() {
        assert_eq!(
            allow_header(&[Method::Get, Method::Options]),
            "GET, OPTIONS"
        );
        assert_eq!(allow_header(&[]), "");
    }
}
