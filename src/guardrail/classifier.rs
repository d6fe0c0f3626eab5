use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ClassifierError;

/// Request sent to the classifier service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierRequest {
    pub text: String,
    /// JSON schema the structured response must follow
    pub schema: Value,
}

/// External classification service. A fallible black box: callers must
/// tolerate any error.
#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: ClassifierRequest) -> Result<Value, ClassifierError>;
}

/// Classify `text` and deserialize the structured response into `T`
pub async fn classify_as<T: DeserializeOwned>(
    classifier: &dyn Classifier,
    text: &str,
    schema: Value,
) -> Result<T, ClassifierError> {
    let value = classifier
        .classify(ClassifierRequest {
            text: text.to_string(),
            schema,
        })
        .await?;

    Ok(serde_json::from_value(value)?)
}

/// Classifier reached over HTTP: POSTs `{text, schema}` and expects the
/// structured verdict as the JSON response body
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, request: ClassifierRequest) -> Result<Value, ClassifierError> {
        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let value: Value = builder.send().await?.error_for_status()?.json().await?;
        debug!("Classifier response: {}", value);

        Ok(value)
    }
}
