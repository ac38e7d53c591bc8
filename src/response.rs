use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::descriptor::RequestDescriptor;
use crate::error::Error;
use crate::util::truncate_body;

/// A completed response together with the descriptor that produced it.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    request: RequestDescriptor,
    simulated: bool,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        request: RequestDescriptor,
        simulated: bool,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            request,
            simulated,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The descriptor as submitted, after any rewrite hook ran.
    pub fn request(&self) -> &RequestDescriptor {
        &self.request
    }

    /// True when the response came from a registered mock.
    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }
}
