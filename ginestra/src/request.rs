//! A borrowed view of the request being routed, and the hints a caller can
//! attach to it through [`http::Extensions`].

use http::{Extensions, HeaderMap, Uri};

/// Send the request to this exact endpoint, bypassing partitioning and the
/// load balancer strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetServiceHint(pub Uri);

/// Route the request to this host, to one of the partitions it serves.
/// Used by scatter-gather callers that have already split their keys per host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHostHint(pub Uri);

/// What routing and strategies get to see of a request.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    uri: &'a Uri,
    headers: Option<&'a HeaderMap>,
    extensions: Option<&'a Extensions>,
}

impl<'a> RouteRequest<'a> {
    pub fn from_uri(uri: &'a Uri) -> Self {
        Self {
            uri,
            headers: None,
            extensions: None,
        }
    }

    /// The logical uri, e.g. `d2://my-service/resource?id=1`.
    pub fn uri(&self) -> &'a Uri {
        self.uri
    }

    pub fn headers(&self) -> Option<&'a HeaderMap> {
        self.headers
    }

    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&'a T> {
        self.extensions.and_then(|e| e.get::<T>())
    }

    pub fn target_service(&self) -> Option<&'a Uri> {
        self.extension::<TargetServiceHint>().map(|h| &h.0)
    }

    pub fn target_host(&self) -> Option<&'a Uri> {
        self.extension::<TargetHostHint>().map(|h| &h.0)
    }
}

impl<'a> From<&'a Uri> for RouteRequest<'a> {
    fn from(uri: &'a Uri) -> Self {
        Self::from_uri(uri)
    }
}

impl<'a, B> From<&'a http::Request<B>> for RouteRequest<'a> {
    fn from(request: &'a http::Request<B>) -> Self {
        Self {
            uri: request.uri(),
            headers: Some(request.headers()),
            extensions: Some(request.extensions()),
        }
    }
}

impl<'a> From<&'a http::request::Parts> for RouteRequest<'a> {
    fn from(parts: &'a http::request::Parts) -> Self {
        Self {
            uri: &parts.uri,
            headers: Some(&parts.headers),
            extensions: Some(&parts.extensions),
        }
    }
}
