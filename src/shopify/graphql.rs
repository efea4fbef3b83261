use crate::config::ShopifyConfig;
use crate::models::FailureKind;
use crate::transport::{self, Delivery, TransportError, TransportGovernor};
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use tracing::debug;

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";

/// Field-level rejection returned inside an otherwise successful envelope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserError {
    #[serde(default)]
    pub field: Option<Vec<String>>,
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

impl UserError {
    pub fn synthetic(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
            code: None,
        }
    }

    /// Position of the offending input for list arguments (`["files", "3", "originalSource"]`).
    pub fn input_index(&self) -> Option<usize> {
        self.field
            .as_ref()?
            .iter()
            .find_map(|segment| segment.parse::<usize>().ok())
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(path) if !path.is_empty() => write!(f, "{}: {}", path.join("."), self.message),
            _ => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("graphql request rejected: {0}")]
    Protocol(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("user errors: {}", join_user_errors(.0))]
    UserErrors(Vec<UserError>),
    #[error("file `{0}` not found")]
    NotFound(String),
}

fn join_user_errors(errors: &[UserError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl RequestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RequestError::Transport(err) if err.is_transient() => FailureKind::TransientTransport,
            RequestError::Transport(_) | RequestError::Protocol(_) | RequestError::Decode(_) => {
                FailureKind::Validation
            }
            RequestError::UserErrors(_) | RequestError::NotFound(_) => FailureKind::DomainUser,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, RequestError::Transport(err) if err.is_unreachable())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Serialize)]
struct GraphqlBody<'a, V> {
    query: &'a str,
    variables: V,
}

/// Admin API client. Cheap to clone; all clones share one governor.
#[derive(Clone)]
pub struct ShopifyClient {
    http: Client,
    governor: TransportGovernor,
    config: ShopifyConfig,
}

impl ShopifyClient {
    pub fn new(http: Client, governor: TransportGovernor, config: ShopifyConfig) -> Self {
        Self {
            http,
            governor,
            config,
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn governor(&self) -> &TransportGovernor {
        &self.governor
    }

    pub async fn graphql<V, T>(
        &self,
        operation: &'static str,
        delivery: Delivery,
        query: &str,
        variables: V,
    ) -> Result<T, RequestError>
    where
        V: Serialize,
        T: DeserializeOwned,
    {
        let url = self.config.graphql_url();
        let body = serde_json::to_vec(&GraphqlBody { query, variables })
            .map_err(|err| RequestError::Decode(err.to_string()))?;

        let response = self
            .governor
            .execute(operation, delivery, || {
                let request = self
                    .http
                    .post(&url)
                    .header(ACCESS_TOKEN_HEADER, &self.config.access_token)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone());
                transport::send(request)
            })
            .await?;

        let envelope: Envelope<T> = response
            .json()
            .map_err(|err| RequestError::Decode(format!("{operation}: {err}")))?;
        if !envelope.errors.is_empty() {
            let message = envelope
                .errors
                .iter()
                .map(|error| error.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            debug!(target: "hermes.shopify", operation, %message, "graphql_errors");
            return Err(RequestError::Protocol(message));
        }
        envelope
            .data
            .ok_or_else(|| RequestError::Decode(format!("{operation}: missing data")))
    }

    pub async fn rest_post<B, T>(
        &self,
        operation: &'static str,
        delivery: Delivery,
        path: &str,
        payload: &B,
    ) -> Result<T, RequestError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let url = self.config.rest_url(path);
        let body =
            serde_json::to_vec(payload).map_err(|err| RequestError::Decode(err.to_string()))?;
        let response = self
            .governor
            .execute(operation, delivery, || {
                let request = self
                    .http
                    .post(&url)
                    .header(ACCESS_TOKEN_HEADER, &self.config.access_token)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone());
                transport::send(request)
            })
            .await?;
        response
            .json()
            .map_err(|err| RequestError::Decode(format!("{operation}: {err}")))
    }
}
