use axum::http::{HeaderMap, Method, Uri};

/// Serializes an inbound request as an HTTP/1.1 message: request line, one
/// `name: value` line per header, a blank line, then the raw body.
///
/// `omitted_header` (the tenant secret) is left out.
pub fn serialize_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
    omitted_header: &str,
) -> Vec<u8> {
    let target = uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or("/");

    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    for (name, value) in headers {
        if name.as_str().eq_ignore_ascii_case(omitted_header) {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}
