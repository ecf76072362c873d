//! OCI distribution API client.
//!
//! Covers what publishing and base image pulls need: the `/v2/` challenge
//! and token exchange, blob existence checks, monolithic blob uploads (`POST`
//! then `PUT ?digest=`), manifest uploads, and manifest and blob downloads.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, info};

use super::auth::{Challenge, TokenResponse, pull_scope, push_scope};
use super::{Authorization, Manifest, Registry, RegistryError, Session};
use crate::oci::{ACCEPTED_MANIFEST_TYPES, Digest};
use crate::secret::{Credentials, Secret};

const DIGEST_HEADER: &str = "docker-content-digest";

/// Token lifetime assumed when the token endpoint does not report one.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 60;

/// Docker Hub is referenced as `docker.io` but served from another host.
const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_ENDPOINT: &str = "registry-1.docker.io";

#[derive(Debug, Clone)]
pub struct HttpRegistry {
  client: Client,
  host: String,
  base_url: String,
}

impl HttpRegistry {
  /// Client for `host` over HTTPS, or plain HTTP when `insecure`.
  pub fn new(host: &str, insecure: bool) -> Result<Self, RegistryError> {
    let scheme = if insecure { "http" } else { "https" };
    let endpoint = if host == DOCKER_HUB { DOCKER_HUB_ENDPOINT } else { host };
    Self::with_base_url(host, &format!("{}://{}", scheme, endpoint))
  }

  /// Client for `host` reached at an explicit base URL.
  pub fn with_base_url(host: &str, base_url: &str) -> Result<Self, RegistryError> {
    let client = Client::builder()
      .user_agent(concat!("probeship/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self {
      client,
      host: host.to_string(),
      base_url: base_url.trim_end_matches('/').to_string(),
    })
  }

  fn repo_url(&self, session: &Session, path: &str) -> String {
    format!("{}/v2/{}/{}", self.base_url, session.repository, path)
  }

  fn authorize(&self, request: RequestBuilder, session: &Session) -> RequestBuilder {
    match &session.authorization {
      Authorization::Anonymous => request,
      Authorization::Basic(credentials) => request.basic_auth(&credentials.username, Some(credentials.password.expose())),
      Authorization::Bearer(token) => request.bearer_auth(token.expose()),
    }
  }

  fn auth_error(&self, message: impl Into<String>) -> RegistryError {
    RegistryError::Auth {
      registry: self.host.clone(),
      message: message.into(),
    }
  }

  /// Check `/v2/` anonymously. `None` means the registry let the anonymous request in.
  async fn challenge(&self) -> Result<Option<Challenge>, RegistryError> {
    let url = format!("{}/v2/", self.base_url);
    let response = self.client.get(&url).send().await?;
    match response.status() {
      status if status.is_success() => Ok(None),
      StatusCode::UNAUTHORIZED => {
        let header = response
          .headers()
          .get(WWW_AUTHENTICATE)
          .and_then(|v| v.to_str().ok())
          .ok_or_else(|| RegistryError::MissingHeader(WWW_AUTHENTICATE.to_string()))?;
        Challenge::parse(header).map(Some)
      }
      status => Err(RegistryError::Status {
        method: "GET".to_string(),
        url,
        status: status.as_u16(),
      }),
    }
  }

  async fn exchange_token(
    &self,
    realm: &str,
    service: Option<&str>,
    repository: &str,
    scope: &str,
    credentials: Option<&Credentials>,
  ) -> Result<Session, RegistryError> {
    let mut query = vec![("scope", scope)];
    if let Some(service) = service {
      query.push(("service", service));
    }

    debug!(realm = %realm, scope = %scope, "requesting registry token");
    let mut request = self.client.get(realm).query(&query);
    if let Some(credentials) = credentials {
      request = request.basic_auth(&credentials.username, Some(credentials.password.expose()));
    }
    let response = request.send().await?;

    if !response.status().is_success() {
      return Err(self.auth_error(format!("token endpoint returned {}", response.status().as_u16())));
    }

    let body: TokenResponse = response
      .json()
      .await
      .map_err(|_| self.auth_error("token endpoint returned an unreadable response"))?;
    let expires_in = body.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
    let token = body
      .into_token()
      .ok_or_else(|| self.auth_error("token endpoint returned no token"))?;

    Ok(Session::new(
      repository,
      Authorization::Bearer(Secret::new(token)),
      Some(expires_in),
    ))
  }

  async fn verify_basic(&self, repository: &str, credentials: &Credentials) -> Result<Session, RegistryError> {
    let response = self
      .client
      .get(format!("{}/v2/", self.base_url))
      .basic_auth(&credentials.username, Some(credentials.password.expose()))
      .send()
      .await?;
    if !response.status().is_success() {
      return Err(self.auth_error(format!("credentials rejected with {}", response.status().as_u16())));
    }
    Ok(Session::new(repository, Authorization::Basic(credentials.clone()), None))
  }

  async fn get(&self, session: &Session, url: &str, accept: Option<String>) -> Result<Response, RegistryError> {
    let mut request = self.authorize(self.client.get(url), session);
    if let Some(accept) = accept {
      request = request.header(ACCEPT, accept);
    }
    Ok(request.send().await?)
  }
}

fn expect_success(method: &str, url: &str, response: Response) -> Result<Response, RegistryError> {
  if response.status().is_success() {
    Ok(response)
  } else {
    Err(RegistryError::Status {
      method: method.to_string(),
      url: url.to_string(),
      status: response.status().as_u16(),
    })
  }
}

fn header_digest(response: &Response) -> Result<Option<Digest>, RegistryError> {
  let Some(value) = response.headers().get(DIGEST_HEADER) else {
    return Ok(None);
  };
  let value = value
    .to_str()
    .map_err(|_| RegistryError::Rejected("non-ascii digest header".to_string()))?;
  value
    .parse()
    .map(Some)
    .map_err(|_| RegistryError::Rejected(format!("invalid digest header '{}'", value)))
}

#[async_trait]
impl Registry for HttpRegistry {
  fn host(&self) -> &str {
    &self.host
  }

  async fn authenticate(&self, repository: &str, credentials: &Credentials) -> Result<Session, RegistryError> {
    let session = match self.challenge().await? {
      Some(Challenge::Bearer { realm, service, .. }) => {
        self
          .exchange_token(&realm, service.as_deref(), repository, &push_scope(repository), Some(credentials))
          .await?
      }
      // An open /v2/ says nothing about the credentials; check them anyway.
      Some(Challenge::Basic { .. }) | None => self.verify_basic(repository, credentials).await?,
    };

    info!(registry = %self.host, repository = %repository, "authenticated");
    Ok(session)
  }

  async fn authenticate_pull(&self, repository: &str) -> Result<Session, RegistryError> {
    let session = match self.challenge().await? {
      None => Session::new(repository, Authorization::Anonymous, None),
      Some(Challenge::Bearer { realm, service, .. }) => {
        self
          .exchange_token(&realm, service.as_deref(), repository, &pull_scope(repository), None)
          .await?
      }
      Some(Challenge::Basic { .. }) => return Err(self.auth_error("anonymous pulls are not allowed")),
    };
    debug!(registry = %self.host, repository = %repository, "opened pull session");
    Ok(session)
  }

  async fn blob_exists(&self, session: &Session, digest: &Digest) -> Result<bool, RegistryError> {
    let url = self.repo_url(session, &format!("blobs/{}", digest));
    let response = self.authorize(self.client.head(&url), session).send().await?;
    match response.status() {
      StatusCode::NOT_FOUND => Ok(false),
      _ => expect_success("HEAD", &url, response).map(|_| true),
    }
  }

  async fn push_blob(&self, session: &Session, digest: &Digest, data: &[u8]) -> Result<(), RegistryError> {
    let start_url = self.repo_url(session, "blobs/uploads/");
    let response = self.authorize(self.client.post(&start_url), session).send().await?;
    let response = expect_success("POST", &start_url, response)?;

    let location = response
      .headers()
      .get(LOCATION)
      .and_then(|v| v.to_str().ok())
      .ok_or_else(|| RegistryError::MissingHeader(LOCATION.to_string()))?;
    let upload_url = if location.starts_with("http://") || location.starts_with("https://") {
      location.to_string()
    } else {
      format!("{}{}", self.base_url, location)
    };
    let separator = if upload_url.contains('?') { '&' } else { '?' };
    let put_url = format!("{}{}digest={}", upload_url, separator, digest);

    let response = self
      .authorize(self.client.put(&put_url), session)
      .header(CONTENT_TYPE, "application/octet-stream")
      .body(data.to_vec())
      .send()
      .await?;
    expect_success("PUT", &put_url, response)?;

    debug!(digest = %digest, size = data.len(), "uploaded blob");
    Ok(())
  }

  async fn push_manifest(
    &self,
    session: &Session,
    reference: &str,
    media_type: &str,
    body: &[u8],
  ) -> Result<Digest, RegistryError> {
    let url = self.repo_url(session, &format!("manifests/{}", reference));
    let response = self
      .authorize(self.client.put(&url), session)
      .header(CONTENT_TYPE, media_type)
      .body(body.to_vec())
      .send()
      .await?;
    let response = expect_success("PUT", &url, response)?;

    let digest = Digest::of(body);
    if let Some(reported) = header_digest(&response)?
      && reported != digest
    {
      return Err(RegistryError::DigestMismatch {
        expected: digest.to_string(),
        actual: reported.to_string(),
      });
    }

    debug!(reference = %reference, digest = %digest, "uploaded manifest");
    Ok(digest)
  }

  async fn resolve(&self, session: &Session, reference: &str) -> Result<Option<Digest>, RegistryError> {
    let url = self.repo_url(session, &format!("manifests/{}", reference));
    let response = self
      .authorize(self.client.head(&url), session)
      .header(ACCEPT, ACCEPTED_MANIFEST_TYPES.join(", "))
      .send()
      .await?;
    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    }
    let response = expect_success("HEAD", &url, response)?;
    header_digest(&response)?
      .map(Some)
      .ok_or_else(|| RegistryError::MissingHeader(DIGEST_HEADER.to_string()))
  }

  async fn fetch_manifest(&self, session: &Session, reference: &str) -> Result<Option<Manifest>, RegistryError> {
    let url = self.repo_url(session, &format!("manifests/{}", reference));
    let response = self
      .get(session, &url, Some(ACCEPTED_MANIFEST_TYPES.join(", ")))
      .await?;
    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    }
    let response = expect_success("GET", &url, response)?;

    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
    let body = response.bytes().await?.to_vec();
    let digest = Digest::of(&body);
    if let Ok(expected) = reference.parse::<Digest>()
      && expected != digest
    {
      return Err(RegistryError::DigestMismatch {
        expected: expected.to_string(),
        actual: digest.to_string(),
      });
    }

    let media_type = match content_type {
      Some(media_type) if !media_type.is_empty() => media_type,
      _ => serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|doc| doc.get("mediaType").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_default(),
    };

    Ok(Some(Manifest {
      media_type,
      body,
      digest,
    }))
  }

  async fn fetch_blob(&self, session: &Session, digest: &Digest) -> Result<Vec<u8>, RegistryError> {
    let url = self.repo_url(session, &format!("blobs/{}", digest));
    let response = self.get(session, &url, None).await?;
    let response = expect_success("GET", &url, response)?;
    let data = response.bytes().await?.to_vec();

    let actual = Digest::of(&data);
    if actual != *digest {
      return Err(RegistryError::DigestMismatch {
        expected: digest.to_string(),
        actual: actual.to_string(),
      });
    }
    debug!(digest = %digest, size = data.len(), "downloaded blob");
    Ok(data)
  }
}
