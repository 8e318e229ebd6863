// Request parsing utilities for HTTP handlers

use hyper::Uri;

/// Extract a query parameter from URI.
///
/// Returns `Some(value)` if the parameter exists, `None` otherwise.
/// The value is URL-decoded automatically.
///
/// # Example
/// ```
/// // For URI: /ws/generate-3d-view?session=alice
/// let uri: hyper::Uri = "/ws/generate-3d-view?session=alice".parse().unwrap();
/// assert_eq!(arch_web::request_parsing::get_query_param(&uri, "session").as_deref(), Some("alice"));
/// ```
pub fn get_query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;

    for param in query.split('&') {
        if let Some((param_key, param_value)) = param.split_once('=') {
            if param_key == key {
                return urlencoding::decode(param_value)
                    .ok()
                    .map(|s| s.to_string());
            }
        }
    }

    None
}
