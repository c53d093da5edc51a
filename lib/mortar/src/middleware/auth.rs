use crate::http::request::HttpRequest;
use grout::encoding;
use hashbrown::HashMap;

/// What a strategy concluded about a request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Verdict {
    pub authenticated: bool,
    pub principal: Option<String>,
    pub reason: &'static str,
}

impl Verdict {
    fn denied(reason: &'static str) -> Verdict {
        Verdict {
            authenticated: false,
            principal: None,
            reason,
        }
    }

    fn granted(principal: String) -> Verdict {
        Verdict {
            authenticated: true,
            principal: Some(principal),
            reason: "ok",
        }
    }
}

/// One credential check. Strategies are pure functions over the request.
#[derive(Debug, Clone)]
pub enum Strategy {
    /// `Authorization: Bearer <token>` against a token list.
    Bearer { tokens: Vec<String> },
    /// A shared key in a configurable header.
    ApiKey { header: String, keys: Vec<String> },
    /// `Authorization: Basic <base64(user:pass)>` against a user table.
    Basic { users: HashMap<String, String> },
}

impl Strategy {
    pub fn bearer(token: &str) -> Strategy {
        Strategy::Bearer {
            tokens: vec![token.to_string()],
        }
    }

    pub fn api_key(header: &str, key: &str) -> Strategy {
        Strategy::ApiKey {
            header: header.to_string(),
            keys: vec![key.to_string()],
        }
    }

    pub fn basic<I: IntoIterator<Item = (String, String)>>(users: I) -> Strategy {
        Strategy::Basic {
            users: users.into_iter().collect(),
        }
    }

    pub fn evaluate(&self, request: &HttpRequest) -> Verdict {
        match self {
            Strategy::Bearer { tokens } => {
                let header = match request.header("authorization") {
                    Some(header) => header,
                    None => return Verdict::denied("missing authorization"),
                };

                let token = match split_scheme(header, "bearer") {
                    Some(token) => token,
                    None => return Verdict::denied("not a bearer credential"),
                };

                if tokens.iter().any(|known| known == token) {
                    Verdict::granted("bearer".to_string())
                } else {
                    Verdict::denied("unknown token")
                }
            }
            Strategy::ApiKey { header, keys } => {
                let presented = match request.header(header) {
                    Some(value) => value,
                    None => return Verdict::denied("missing api key"),
                };

                if keys.iter().any(|known| known == presented) {
                    Verdict::granted("api-key".to_string())
                } else {
                    Verdict::denied("unknown api key")
                }
            }
            Strategy::Basic { users } => {
                let header = match request.header("authorization") {
                    Some(header) => header,
                    None => return Verdict::denied("missing authorization"),
                };

                let encoded = match split_scheme(header, "basic") {
                    Some(encoded) => encoded,
                    None => return Verdict::denied("not a basic credential"),
                };

                let decoded = match encoding::base64::decode(encoded)
                    .ok()
                    .and_then(|raw| String::from_utf8(raw).ok())
                {
                    Some(decoded) => decoded,
                    None => return Verdict::denied("malformed basic credential"),
                };

                let mut parts = decoded.splitn(2, ':');
                let user = parts.next().unwrap_or("");
                let pass = parts.next().unwrap_or("");

                match users.get(user) {
                    Some(known) if known == pass => Verdict::granted(user.to_string()),
                    _ => Verdict::denied("bad username or password"),
                }
            }
        }
    }

    /// `WWW-Authenticate` value advertised when this strategy leads the
    /// chain.
    pub fn challenge(&self) -> String {
        match self {
            Strategy::Bearer { .. } => "Bearer".to_string(),
            Strategy::ApiKey { header, .. } => format!("ApiKey header=\"{}\"", header),
            Strategy::Basic { .. } => "Basic realm=\"restricted\"".to_string(),
        }
    }
}

fn split_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let mut parts = header.splitn(2, ' ');
    let presented = parts.next()?;

    if !presented.eq_ignore_ascii_case(scheme) {
        return None;
    }

    Some(parts.next()?.trim())
}

/// Ordered strategy chain; the first to authenticate wins.
#[derive(Debug, Clone, Default)]
pub struct AuthChain {
    strategies: Vec<Strategy>,
}

impl AuthChain {
    pub fn new() -> AuthChain {
        AuthChain {
            strategies: Vec::new(),
        }
    }

    pub fn push(&mut self, strategy: Strategy) {
        self.strategies.push(strategy);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Runs the chain in registration order; the principal of the first
    /// successful strategy is returned.
    pub fn evaluate(&self, request: &HttpRequest) -> Option<String> {
        for strategy in self.strategies.iter() {
            let verdict = strategy.evaluate(request);

            if verdict.authenticated {
                return verdict.principal;
            }
        }

        None
    }

    /// Challenge of the first configured strategy.
    pub fn challenge(&self) -> Option<String> {
        self.strategies.first().map(Strategy::challenge)
    }
}
