//! Embedded web UI.

use rust_embed::RustEmbed;
use warp::http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use warp::hyper::Body;
use warp::path::Tail;
use warp::reply::Response;
use warp::{Filter, Rejection};

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/web/"]
struct Assets;

fn serve(path: &str) -> Result<Response, Rejection> {
    let path = if path.is_empty() { "index.html" } else { path };
    let asset = Assets::get(path).ok_or_else(warp::reject::not_found)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    let mut res = Response::new(Body::from(asset.data.into_owned()));
    let headers = res.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(res)
}

/// GET / and GET /:asset
pub fn assets_route() -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path::tail()
        .and(warp::get())
        .and_then(|tail: Tail| async move { serve(tail.as_str()) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_index() {
        let res = warp::test::request().path("/").reply(&assets_route()).await;
        assert_eq!(res.status(), 200);
        assert!(res.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
    }

    #[tokio::test]
    async fn test_missing_asset() {
        let matched = warp::test::request()
            .path("/nope.js")
            .matches(&assets_route())
            .await;
        assert!(!matched);
    }
}
