use std::collections::BTreeMap;

use http::Method;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::util::sha256_hex;

/// Whether a failed request may be persisted for later replay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorePolicy {
    #[default]
    None,
    OfflineRetryable,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Parameters {
    #[default]
    None,
    Query(Vec<(String, String)>),
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

impl Parameters {
    fn canonical(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::Query(pairs) => format!("query:{}", canonical_pairs(pairs)),
            Self::Form(pairs) => format!("form:{}", canonical_pairs(pairs)),
            // serde_json orders object keys, so equal documents print equally.
            Self::Json(value) => format!("json:{value}"),
        }
    }
}

fn canonical_pairs(pairs: &[(String, String)]) -> String {
    let mut sorted: Vec<_> = pairs.iter().collect();
    sorted.sort();
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in sorted {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

/// Semantic description of a request before it is turned into wire form.
///
/// The identity [`key`](Self::key) is derived from the method, path and
/// parameters only, so headers and store policy never change which mock or
/// etag entry a request maps to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    #[serde(with = "method_serde")]
    method: Method,
    path: String,
    #[serde(default)]
    parameters: Parameters,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    store_policy: StorePolicy,
    #[serde(default)]
    revalidate: bool,
}

impl RequestDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            parameters: Parameters::None,
            headers: BTreeMap::new(),
            store_policy: StorePolicy::None,
            revalidate: false,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Appends a query pair, switching the parameters to query form if needed.
    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let pair = (name.into(), value.into());
        match &mut self.parameters {
            Parameters::Query(pairs) => pairs.push(pair),
            other => *other = Parameters::Query(vec![pair]),
        }
        self
    }

    pub fn query<T>(self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let pairs = encode_pairs(params).map_err(|source| Error::SerializeQuery { source })?;
        Ok(self.with_parameters(Parameters::Query(pairs)))
    }

    pub fn form<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let pairs = encode_pairs(payload).map_err(|source| Error::SerializeForm { source })?;
        Ok(self.with_parameters(Parameters::Form(pairs)))
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(|source| Error::SerializeJson { source })?;
        Ok(self.with_parameters(Parameters::Json(value)))
    }

    /// Header names are validated when the request is built, not here.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_store_policy(mut self, store_policy: StorePolicy) -> Self {
        self.store_policy = store_policy;
        self
    }

    pub fn offline_retryable(self) -> Self {
        self.with_store_policy(StorePolicy::OfflineRetryable)
    }

    /// Attach `If-None-Match` from the etag store when an entry exists.
    pub fn revalidate(mut self, revalidate: bool) -> Self {
        self.revalidate = revalidate;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn store_policy(&self) -> StorePolicy {
        self.store_policy
    }

    pub fn revalidates(&self) -> bool {
        self.revalidate
    }

    /// Stable identity used for mock lookup and etag storage.
    pub fn key(&self) -> String {
        let canonical = format!(
            "{} {} {}",
            self.method.as_str(),
            self.path,
            self.parameters.canonical()
        );
        sha256_hex(&canonical)
    }
}

fn encode_pairs<T>(params: &T) -> Result<Vec<(String, String)>, serde_urlencoded::ser::Error>
where
    T: Serialize + ?Sized,
{
    let encoded = serde_urlencoded::to_string(params)?;
    Ok(url::form_urlencoded::parse(encoded.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect())
}

mod method_serde {
    use http::Method;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(method: &Method, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(method.as_str())
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Method, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Method::from_bytes(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn key_ignores_headers_and_store_policy() {
        let plain = RequestDescriptor::new("/v1/items").query_pair("page", "2");
        let decorated = plain
            .clone()
            .header("X-Trace", "abc")
            .offline_retryable()
            .revalidate(true);
        assert_eq!(plain.key(), decorated.key());
    }

    #[test]
    fn key_is_order_insensitive_for_pairs() {
        let left = RequestDescriptor::new("/v1/items")
            .query_pair("a", "1")
            .query_pair("b", "2");
        let right = RequestDescriptor::new("/v1/items")
            .query_pair("b", "2")
            .query_pair("a", "1");
        assert_eq!(left.key(), right.key());
    }

    #[test]
    fn key_distinguishes_method_path_and_parameters() {
        let base = RequestDescriptor::new("/v1/items");
        let keys = [
            base.key(),
            base.clone().with_method(Method::POST).key(),
            base.clone().with_path("/v1/other").key(),
            base.clone()
                .json(&json!({ "name": "demo" }))
                .expect("serialize payload")
                .key(),
        ];
        for (index, key) in keys.iter().enumerate() {
            assert_eq!(key.len(), 64);
            for other in &keys[index + 1..] {
                assert_ne!(key, other);
            }
        }
    }

    #[test]
    fn descriptor_survives_json_persistence() {
        let descriptor = RequestDescriptor::new("/v1/items")
            .with_method(Method::PATCH)
            .form(&[("name", "demo")])
            .expect("serialize form")
            .header("X-Client", "test")
            .offline_retryable();
        let encoded = serde_json::to_string(&descriptor).expect("encode descriptor");
        let decoded: RequestDescriptor =
            serde_json::from_str(&encoded).expect("decode descriptor");
        assert_eq!(decoded, descriptor);
        assert_eq!(decoded.key(), descriptor.key());
        assert_eq!(decoded.headers().get("x-client"), Some(&"test".to_owned()));
    }
}
