//! Routes and encoding of the HTTP update protocol

use treesync_types::{Error, Result, UpdateRequest};

/// `POST` route answering whether an app has updates
pub const HAS_UPDATE_ROUTE: &str = "/hasupdate/:app";

/// `GET` route serving built patch archives
pub const PATCH_FILE_ROUTE: &str = "/tmpfiles/:file";

/// `GET` route serving single gzip-encoded app files
pub const APP_FILE_ROUTE: &str = "/app/:app/*path";

/// Form field carrying the JSON update request
pub const REQUEST_FIELD: &str = "req";

/// URL path prefix of patch archives
pub const PATCH_FILE_PREFIX: &str = "/tmpfiles";

/// Server-relative URL of the patch archive `name`
pub fn patch_file_url(name: &str) -> String {
    format!("{}/{}", PATCH_FILE_PREFIX, name)
}

/// Base URL for `host`, defaulting to plain HTTP when no scheme is given
pub fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

/// Decode the JSON carried in the `req` form field
pub fn decode_request(raw: &str) -> Result<UpdateRequest> {
    serde_json::from_str(raw).map_err(|e| Error::protocol(format!("invalid update request: {}", e)))
}

/// Encode a request for the `req` form field
pub fn encode_request(request: &UpdateRequest) -> Result<String> {
    serde_json::to_string(request)
        .map_err(|e| Error::protocol(format!("cannot encode update request: {}", e)))
}
