//! Blocking client for a Rucio-style REST catalog.
//!
//! Error responses carry the server-side exception name in the
//! `ExceptionClass` header (or body field); that name decides whether a
//! failure is a benign [`Outcome`] or a [`CatalogError`]. Listing endpoints
//! answer with one JSON document per line.

use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use super::{
    Catalog, CatalogError, CatalogErrorKind, CatalogResult, DidInfo, FileEntry, FilePayload,
    Metadata, Outcome, ReplicaEntry,
};
use crate::config::{CatalogSettings, AUTH_TYPES};
use crate::did::Did;

const EXCEPTION_HEADER: &str = "ExceptionClass";

#[derive(Clone, Copy, Debug)]
enum Method {
    Get,
    Post,
    Put,
}

/// A raw answer from the server.
struct Reply {
    status: u16,
    exception: Option<String>,
    body: String,
}

/// Catalog backed by the remote service.
pub struct RestCatalog {
    agent: ureq::Agent,
    base: Url,
    account: String,
    token: Option<String>,
    /// Where a token for `account` is issued.
    auth_endpoint: Url,
    max_retries: u32,
    retry_delay: Duration,
}

impl std::fmt::Debug for RestCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCatalog")
            .field("base", &self.base.as_str())
            .field("account", &self.account)
            .field("auth_endpoint", &self.auth_endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl RestCatalog {
    pub fn new(settings: &CatalogSettings) -> Result<Self, CatalogError> {
        let base = Url::parse(&settings.rucio_host).map_err(|source| {
            CatalogError::new(
                CatalogErrorKind::Rejected,
                format!("invalid catalog URL '{}': {}", settings.rucio_host, source),
            )
        })?;
        if base.cannot_be_a_base() {
            return Err(CatalogError::new(
                CatalogErrorKind::Rejected,
                format!("catalog URL '{}' cannot hold a path", settings.rucio_host),
            ));
        }

        let auth_endpoint = auth_endpoint(&settings.auth_host, &settings.auth_type)?;

        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(settings.request_timeout_secs)))
            .http_status_as_error(false)
            .build();

        Ok(Self {
            agent: config.into(),
            base,
            account: settings.account.clone(),
            token: settings.auth_token.clone(),
            auth_endpoint,
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn did_url(&self, did: &Did, tail: &[&str]) -> Url {
        let mut segments = vec!["dids", did.scope.as_str(), did.name.as_str()];
        segments.extend_from_slice(tail);
        self.url(&segments)
    }

    fn authorize<B>(&self, request: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        let request = request
            .header("X-Rucio-Account", self.account.as_str())
            .header("Accept", "application/json");
        match &self.token {
            Some(token) => request.header("X-Rucio-Auth-Token", token.as_str()),
            None => request,
        }
    }

    fn attempt(
        &self,
        method: Method,
        url: &Url,
        body: Option<&Value>,
    ) -> Result<Reply, ureq::Error> {
        let mut response = match method {
            Method::Get => self.authorize(self.agent.get(url.as_str())).call()?,
            Method::Post => self
                .authorize(self.agent.post(url.as_str()))
                .send_json(body.unwrap_or(&Value::Null))?,
            Method::Put => self
                .authorize(self.agent.put(url.as_str()))
                .send_json(body.unwrap_or(&Value::Null))?,
        };

        let exception = response
            .headers()
            .get(EXCEPTION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(Reply {
            status: response.status().as_u16(),
            exception,
            body: response.body_mut().read_to_string()?,
        })
    }

    /// Sends a request, retrying transport failures, and maps the answer.
    fn send(&self, method: Method, url: &Url, body: Option<&Value>) -> CatalogResult<String> {
        let mut attempt = 0;
        loop {
            debug!(?method, url = url.as_str(), attempt, "catalog request");
            match self.attempt(method, url, body) {
                Ok(reply) => return self.explain_auth_failure(classify(reply)),
                Err(source) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        url = url.as_str(),
                        attempt,
                        error = %source,
                        "catalog request failed, retrying"
                    );
                    thread::sleep(self.retry_delay);
                }
                Err(source) => {
                    return Err(CatalogError::new(
                        CatalogErrorKind::Transport,
                        format!("{} failed: {}", url, source),
                    ))
                }
            }
        }
    }

    /// Points a 401 at the auth endpoint the token should come from.
    fn explain_auth_failure(&self, result: CatalogResult<String>) -> CatalogResult<String> {
        result.map_err(|mut e| {
            if e.kind == (CatalogErrorKind::Server { status: 401 }) {
                let state = if self.token.is_some() { "was refused" } else { "is not set" };
                e.message = format!(
                    "{} (auth token {}; request one for account '{}' at {})",
                    e.message, state, self.account, self.auth_endpoint
                );
            }
            e
        })
    }

    fn send_unit(&self, method: Method, url: &Url, body: Option<&Value>) -> CatalogResult<()> {
        map_outcome(self.send(method, url, body)?, |_| Ok(()))
    }

    fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &Url,
        body: Option<&Value>,
    ) -> CatalogResult<T> {
        map_outcome(self.send(method, url, body)?, |text| {
            serde_json::from_str(&text).map_err(decode_error)
        })
    }

    fn send_lines<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &Url,
        body: Option<&Value>,
    ) -> CatalogResult<Vec<T>> {
        map_outcome(self.send(method, url, body)?, |text| parse_lines(&text))
    }
}

/// `{auth_host}/auth/{auth_type}`, the endpoint issuing tokens.
fn auth_endpoint(auth_host: &str, auth_type: &str) -> Result<Url, CatalogError> {
    if !AUTH_TYPES.contains(&auth_type) {
        return Err(CatalogError::new(
            CatalogErrorKind::Rejected,
            format!(
                "unknown auth type '{}' (expected one of: {})",
                auth_type,
                AUTH_TYPES.join(", ")
            ),
        ));
    }
    let mut url = Url::parse(auth_host).map_err(|source| {
        CatalogError::new(
            CatalogErrorKind::Rejected,
            format!("invalid auth URL '{}': {}", auth_host, source),
        )
    })?;
    match url.path_segments_mut() {
        Ok(mut path) => {
            path.pop_if_empty().extend(["auth", auth_type]);
        }
        Err(()) => {
            return Err(CatalogError::new(
                CatalogErrorKind::Rejected,
                format!("auth URL '{}' cannot hold a path", auth_host),
            ))
        }
    }
    Ok(url)
}

fn map_outcome<T>(
    outcome: Outcome<String>,
    decode: impl FnOnce(String) -> Result<T, CatalogError>,
) -> CatalogResult<T> {
    Ok(match outcome {
        Outcome::Done(text) => Outcome::Done(decode(text)?),
        Outcome::AlreadyExists(message) => Outcome::AlreadyExists(message),
        Outcome::NotFound(message) => Outcome::NotFound(message),
    })
}

fn decode_error(source: serde_json::Error) -> CatalogError {
    CatalogError::new(CatalogErrorKind::Decode, source.to_string())
}

/// Parses a newline-delimited JSON stream.
fn parse_lines<T: DeserializeOwned>(text: &str) -> Result<Vec<T>, CatalogError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).map_err(decode_error))
        .collect()
}

/// Maps a server reply onto an outcome.
fn classify(reply: Reply) -> CatalogResult<String> {
    if (200..300).contains(&reply.status) {
        return Ok(Outcome::Done(reply.body));
    }

    let parsed: Option<Value> = serde_json::from_str(&reply.body).ok();
    let field = |key: &str| {
        parsed
            .as_ref()
            .and_then(|value| value.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let exception = reply.exception.or_else(|| field("ExceptionClass"));
    let message = field("ExceptionMessage").unwrap_or_else(|| reply.body.trim().to_string());

    match exception.as_deref() {
        Some(name) if name.ends_with("AlreadyExists") || name.starts_with("Duplicate") => {
            Ok(Outcome::AlreadyExists(message))
        }
        Some(name) if name.ends_with("NotFound") => Ok(Outcome::NotFound(message)),
        Some("UnsupportedOperation") => {
            Err(CatalogError::new(CatalogErrorKind::Unsupported, message))
        }
        Some(name) => Err(CatalogError::new(
            CatalogErrorKind::Server {
                status: reply.status,
            },
            format!("{}: {}", name, message),
        )),
        None => match reply.status {
            404 => Ok(Outcome::NotFound(message)),
            409 => Ok(Outcome::AlreadyExists(message)),
            status => Err(CatalogError::new(
                CatalogErrorKind::Server { status },
                message,
            )),
        },
    }
}

fn did_refs(dids: &[Did]) -> Vec<Value> {
    dids.iter()
        .map(|did| json!({"scope": did.scope, "name": did.name}))
        .collect()
}

impl Catalog for RestCatalog {
    fn account(&self) -> &str {
        &self.account
    }

    fn add_dataset(&self, did: &Did, meta: &Metadata) -> CatalogResult<()> {
        let body = json!({"type": "DATASET", "meta": meta});
        self.send_unit(Method::Post, &self.did_url(did, &[]), Some(&body))
    }

    fn set_status(&self, did: &Did, open: bool) -> CatalogResult<()> {
        let body = json!({"open": open});
        self.send_unit(Method::Put, &self.did_url(did, &["status"]), Some(&body))
    }

    fn set_metadata(&self, did: &Did, key: &str, value: &Value) -> CatalogResult<()> {
        let body = json!({"value": value});
        self.send_unit(Method::Post, &self.did_url(did, &["meta", key]), Some(&body))
    }

    fn get_metadata(&self, did: &Did) -> CatalogResult<Metadata> {
        self.send_json(Method::Get, &self.did_url(did, &["meta"]), None)
    }

    fn get_did(&self, did: &Did) -> CatalogResult<DidInfo> {
        self.send_json(Method::Get, &self.did_url(did, &[]), None)
    }

    fn attach_dids(&self, did: &Did, dids: &[Did]) -> CatalogResult<()> {
        let body = json!({"dids": did_refs(dids)});
        self.send_unit(Method::Post, &self.did_url(did, &["dids"]), Some(&body))
    }

    fn add_replicas(&self, rse: &str, files: &[FilePayload]) -> CatalogResult<()> {
        let body = json!({"rse": rse, "files": files, "ignore_availability": true});
        self.send_unit(Method::Post, &self.url(&["replicas"]), Some(&body))
    }

    fn add_files_to_dataset(
        &self,
        did: &Did,
        files: &[FilePayload],
        rse: Option<&str>,
    ) -> CatalogResult<()> {
        let mut body = json!({"dids": files});
        if let Some(rse) = rse {
            body["rse"] = Value::from(rse);
        }
        self.send_unit(Method::Post, &self.did_url(did, &["dids"]), Some(&body))
    }

    fn list_files(&self, did: &Did, long: bool) -> CatalogResult<Vec<FileEntry>> {
        let mut url = self.did_url(did, &["files"]);
        if long {
            url.query_pairs_mut().append_pair("long", "True");
        }
        self.send_lines(Method::Get, &url, None)
    }

    fn list_replicas(&self, dids: &[Did], rse: Option<&str>) -> CatalogResult<Vec<ReplicaEntry>> {
        let mut body = json!({"dids": did_refs(dids)});
        if let Some(rse) = rse {
            body["rse_expression"] = Value::from(rse);
        }
        self.send_lines(Method::Post, &self.url(&["replicas", "list"]), Some(&body))
    }
}
