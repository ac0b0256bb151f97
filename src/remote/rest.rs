use async_trait::async_trait;
use anyhow::{bail, Context};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde_json::{Map, Value};

use super::{split_path, RemoteResult, RemoteStore};
use crate::error::RemoteError;

/// Realtime-database REST client: every path maps to `{base}/{path}.json`.
#[derive(Clone)]
pub struct RestRemoteStore {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl RestRemoteStore {
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid remote base url {base_url}"))?;
        if base_url.cannot_be_a_base() {
            bail!("remote base url {base_url} cannot carry a path");
        }
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    /// Each segment is percent-encoded, so a key can never add path levels.
    fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let segments = split_path(path);
        if let Ok(mut parts) = url.path_segments_mut() {
            parts.pop_if_empty();
            match segments.split_last() {
                Some((last, parents)) => {
                    parts.extend(parents);
                    parts.push(&format!("{last}.json"));
                }
                None => {
                    parts.push(".json");
                }
            }
        }
        url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token.as_str())]),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> RemoteResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|err| RemoteError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(RemoteError::Unavailable(format!("{status}: {message}")));
        }
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn json(response: Response) -> RemoteResult<Value> {
        response
            .json::<Value>()
            .await
            .map_err(|err| RemoteError::Decode(err.to_string()))
    }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn get(&self, path: &str) -> RemoteResult<Option<Value>> {
        let response = self.send(self.request(Method::GET, path)).await?;
        match Self::json(response).await? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    async fn set(&self, path: &str, value: Value) -> RemoteResult<()> {
        self.send(self.request(Method::PUT, path).json(&value))
            .await?;
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> RemoteResult<()> {
        self.send(self.request(Method::PATCH, path).json(&fields))
            .await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> RemoteResult<()> {
        self.send(self.request(Method::DELETE, path)).await?;
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> RemoteResult<String> {
        let response = self
            .send(self.request(Method::POST, path).json(&value))
            .await?;
        let body = Self::json(response).await?;
        body.get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Decode("push response missing `name`".into()))
    }

    async fn query_equal(
        &self,
        path: &str,
        field: &str,
        value: &Value,
    ) -> RemoteResult<Vec<(String, Value)>> {
        // The REST query language expects JSON-encoded operands.
        let order_by = serde_json::to_string(field)?;
        let equal_to = serde_json::to_string(value)?;
        let builder = self
            .request(Method::GET, path)
            .query(&[("orderBy", order_by), ("equalTo", equal_to)]);

        let response = self.send(builder).await?;
        let body = Self::json(response).await?;
        let matches = match body {
            Value::Object(children) => children.into_iter().collect(),
            Value::Null => Vec::new(),
            other => {
                return Err(RemoteError::Decode(format!(
                    "query returned non-object payload: {other}"
                )))
            }
        };
        Ok(matches)
    }
}
