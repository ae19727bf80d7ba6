use crate::cache::{CacheStatus, Rendered};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};

/// Response header that reports whether the body came from the render cache.
pub const RENDER_CACHE_HEADER: HeaderName = HeaderName::from_static("x-render-cache");

impl CacheStatus {
    fn header_value(&self) -> HeaderValue {
        let value: &'static str = self.into();
        HeaderValue::from_static(value)
    }
}

impl IntoResponse for Rendered {
    fn into_response(self) -> Response {
        let content_type = HeaderValue::from_str(&self.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(crate::cache::DEFAULT_CONTENT_TYPE));
        (
            [
                (CONTENT_TYPE, content_type),
                (RENDER_CACHE_HEADER, self.status.header_value()),
            ],
            self.body,
        )
            .into_response()
    }
}
