mod support;
use std::io::Write;

use rehttp::{Client, Options};
use support::server::{self, Body};

fn gzip(content: &[u8]) -> Vec<u8> {
    let mut encoder = libflate::gzip::Encoder::new(Vec::new()).unwrap();
    encoder.write_all(content).unwrap();
    encoder.finish().into_result().unwrap()
}

fn client(options: Options, server: &server::Server) -> Client {
    Client::new(options.pool_initial_size(0), "127.0.0.1", server.port()).unwrap()
}

#[tokio::test]
async fn gzip_response() {
    let _ = env_logger::try_init();

    let content: String = (0..10_000).map(|i| format!("test {i}")).collect();
    let expected = content.clone();

    let server = server::http(move |req| {
        let gzipped = gzip(content.as_bytes());
        async move {
            assert_eq!(req.headers()["accept-encoding"], "gzip");
            http::Response::builder()
                .header("content-encoding", "gzip")
                .header("content-length", gzipped.len())
                .body(Body::from(gzipped))
                .unwrap()
        }
    });

    let url = format!("http://{}/gzip", server.addr());
    let res = client(Options::new(), &server).get(&url).send().await.unwrap();

    assert!(res.headers().get("content-encoding").is_none());
    assert!(res.headers().get("content-length").is_none());
    assert_eq!(res.content_length(), None);

    let body = res.text().await.unwrap();
    assert_eq!(body, expected);
}

#[tokio::test]
async fn gzip_empty_body() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "HEAD");
        http::Response::builder()
            .header("content-encoding", "gzip")
            .body(Body::default())
            .unwrap()
    });

    let url = format!("http://{}/gzip", server.addr());
    let res = client(Options::new(), &server).head(&url).send().await.unwrap();

    let body = res.text().await.unwrap();
    assert_eq!(body, "");
}

#[tokio::test]
async fn caller_accept_encoding_is_left_alone() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["accept-encoding"], "gzip");
        http::Response::builder()
            .header("content-encoding", "gzip")
            .body(Body::from(gzip(b"raw")))
            .unwrap()
    });

    let url = format!("http://{}/gzip", server.addr());
    let res = client(Options::new(), &server)
        .get(&url)
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();

    assert_eq!(res.headers()["content-encoding"], "gzip");
    let body = res.bytes().await.unwrap();
    assert_eq!(&*body, &*gzip(b"raw"));
}

#[tokio::test]
async fn range_request_is_not_decoded() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert!(req.headers().get("accept-encoding").is_none());
        assert_eq!(req.headers()["range"], "bytes=0-3");
        http::Response::builder()
            .status(206)
            .body(Body::from("rang"))
            .unwrap()
    });

    let url = format!("http://{}/range", server.addr());
    let res = client(Options::new(), &server)
        .get(&url)
        .header("range", "bytes=0-3")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 206);
    assert_eq!(res.text().await.unwrap(), "rang");
}

#[tokio::test]
async fn compression_disabled() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert!(req.headers().get("accept-encoding").is_none());
        http::Response::new(Body::from("plain"))
    });

    let url = format!("http://{}/", server.addr());
    let res = client(Options::new().disable_compression(true), &server)
        .get(&url)
        .send()
        .await
        .unwrap();

    assert_eq!(res.text().await.unwrap(), "plain");
}

#[tokio::test]
async fn corrupt_gzip_is_a_decode_error() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        http::Response::builder()
            .header("content-encoding", "gzip")
            .body(Body::from("definitely not gzip"))
            .unwrap()
    });

    let url = format!("http://{}/", server.addr());
    let res = client(Options::new(), &server).get(&url).send().await.unwrap();

    let err = res.bytes().await.unwrap_err();
    assert!(err.is_decode());
}
