// src/routes.rs
use serde::Deserialize;
use tracing::{debug, warn};

use crate::accounts::Accounts;
use crate::http::Status;
use crate::script::ScriptClient;
use crate::urlcode;

/// POST targets handled by the server instead of being served as files,
/// recognised by the last path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostRoute {
    Login,
    Register,
    CheckLogin,
    CheckRegister,
    RunScript,
}

impl PostRoute {
    pub fn from_segment(segment: &str) -> Option<Self> {
        const ROUTES: [(&str, PostRoute); 5] = [
            ("login", PostRoute::Login),
            ("register", PostRoute::Register),
            ("check-login", PostRoute::CheckLogin),
            ("check-register", PostRoute::CheckRegister),
            ("run-script", PostRoute::RunScript),
        ];
        ROUTES
            .iter()
            .find(|(name, _)| segment.eq_ignore_ascii_case(name))
            .map(|(_, route)| *route)
    }
}

/// Splits `/a/b/check-login` into the route and the directory prefix `/a/b/`.
pub fn match_route(path: &str) -> Option<(PostRoute, &str)> {
    let cut = path.rfind('/')? + 1;
    PostRoute::from_segment(&path[cut..]).map(|route| (route, &path[..cut]))
}

/// `user=<..>&password=<..>` form body.
#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn from_form(body: &[u8]) -> Option<Self> {
        serde_urlencoded::from_bytes(body).ok()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Serve this static path instead.
    Page(String),
    /// Send these bytes as the body.
    Output(Vec<u8>),
    Fail(Status),
}

/// Collaborators reachable from POST routes.
pub struct Services {
    pub accounts: Accounts,
    pub script: Option<ScriptClient>,
}

impl Services {
    pub fn new(accounts: Accounts, script: Option<ScriptClient>) -> Self {
        Self { accounts, script }
    }

    pub fn handle(&self, route: PostRoute, dir: &str, body: &[u8]) -> RouteOutcome {
        let page = |name: &str| RouteOutcome::Page(format!("{}{}", dir, name));
        match route {
            PostRoute::Login => page("login.html"),
            PostRoute::Register => page("register.html"),
            PostRoute::CheckLogin => {
                let ok = Credentials::from_form(body)
                    .is_some_and(|c| self.accounts.verify(&c.user, &c.password));
                debug!(ok, "login attempt");
                page(if ok { "welcome.html" } else { "login_error.html" })
            }
            PostRoute::CheckRegister => {
                let registered = match Credentials::from_form(body) {
                    Some(c) => self.accounts.register(&c.user, &c.password),
                    None => Ok(false),
                };
                match registered {
                    Ok(true) => page("login.html"),
                    Ok(false) => page("register_error.html"),
                    Err(e) => {
                        warn!(error = %e, "registration failed");
                        page("register_error.html")
                    }
                }
            }
            PostRoute::RunScript => {
                let Some(client) = &self.script else {
                    return RouteOutcome::Fail(Status::NotFound);
                };
                let payload = urlcode::decode_bytes(body);
                match client.run(&payload) {
                    Ok(output) => RouteOutcome::Output(output),
                    Err(e) => {
                        warn!(error = %e, "script route failed");
                        RouteOutcome::Fail(Status::InternalError)
                    }
                }
            }
        }
    }
}
