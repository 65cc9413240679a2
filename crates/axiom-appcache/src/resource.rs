//! Cached resources

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Why a resource is in a cache. A resource can be several kinds at once,
/// e.g. an explicit entry that is also a fallback target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceType(u32);

impl ResourceType {
    pub const MASTER: ResourceType = ResourceType(1 << 0);
    pub const MANIFEST: ResourceType = ResourceType(1 << 1);
    pub const EXPLICIT: ResourceType = ResourceType(1 << 2);
    pub const FOREIGN: ResourceType = ResourceType(1 << 3);
    pub const FALLBACK: ResourceType = ResourceType(1 << 4);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: ResourceType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ResourceType {
    type Output = ResourceType;

    fn bitor(self, rhs: Self) -> Self::Output {
        ResourceType(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ResourceType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The parts of the network response kept alongside the body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub url: Url,
    pub status_code: u16,
    pub mime_type: Option<String>,
    pub text_encoding_name: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl ResourceResponse {
    /// A plain 200 response for `url`
    pub fn ok(url: Url, mime_type: &str) -> Self {
        Self {
            url,
            status_code: 200,
            mime_type: Some(mime_type.to_string()),
            text_encoding_name: None,
            headers: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationCacheResource {
    url: Url,
    response: ResourceResponse,
    resource_type: ResourceType,
    data: Vec<u8>,
    storage_id: Option<i64>,
    /// File name in the flat file directory when the body is not in SQLite
    path: Option<PathBuf>,
}

impl ApplicationCacheResource {
    pub fn new(url: Url, response: ResourceResponse, resource_type: ResourceType, data: Vec<u8>) -> Self {
        Self {
            url,
            response,
            resource_type,
            data,
            storage_id: None,
            path: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn response(&self) -> &ResourceResponse {
        &self.response
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn add_type(&mut self, resource_type: ResourceType) {
        self.resource_type |= resource_type;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn storage_id(&self) -> Option<i64> {
        self.storage_id
    }

    pub(crate) fn set_storage_id(&mut self, storage_id: Option<i64>) {
        self.storage_id = storage_id;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn set_path(&mut self, path: Option<PathBuf>) {
        self.path = path;
    }

    /// Bytes this resource is expected to take up once stored: the body plus
    /// the text columns and the fixed width fields of its rows
    pub fn estimated_size_in_storage(&self) -> u64 {
        let headers: usize = self
            .response
            .headers
            .iter()
            .map(|(key, value)| key.len() + value.len() + 2)
            .sum();
        let text = self.url.as_str().len()
            + self.response.url.as_str().len()
            + self.response.mime_type.as_deref().map_or(0, str::len)
            + self.response.text_encoding_name.as_deref().map_or(0, str::len);

        // status code and data id
        (self.data.len() + headers + text + 8) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_flags_combine() {
        let mut kind = ResourceType::EXPLICIT;
        assert!(!kind.contains(ResourceType::FALLBACK));

        kind |= ResourceType::FALLBACK;
        assert!(kind.contains(ResourceType::EXPLICIT));
        assert!(kind.contains(ResourceType::FALLBACK));
        assert_eq!(kind.bits(), 4 | 16);
        assert_eq!(ResourceType::from_bits(kind.bits()), kind);
    }

    #[test]
    fn test_estimated_size_counts_body_and_metadata() {
        let url = Url::parse("https://example.com/app.js").unwrap();
        let mut response = ResourceResponse::ok(url.clone(), "text/javascript");
        response.headers.push(("Content-Type".into(), "text/javascript".into()));
        let resource = ApplicationCacheResource::new(url, response, ResourceType::EXPLICIT, vec![0; 100]);

        let size = resource.estimated_size_in_storage();
        assert!(size > 100);
        assert_eq!(resource.response().header("content-type"), Some("text/javascript"));
    }
}
