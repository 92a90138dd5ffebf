mod support;
use std::time::Duration;

use http::header::{CONNECTION, CONTENT_LENGTH, USER_AGENT};
use rehttp::{Client, Method, Options};
use support::server::{self, Body};

fn client(options: Options, server: &server::Server) -> Client {
    Client::new(options.pool_initial_size(0), "127.0.0.1", server.port()).unwrap()
}

#[tokio::test]
async fn auto_headers() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "GET");

        assert_eq!(req.headers()[USER_AGENT], rehttp::options::DEFAULT_USER_AGENT);
        assert_eq!(req.headers()[CONNECTION], "Keep-Alive");
        if cfg!(feature = "gzip") {
            assert_eq!(req.headers()["accept-encoding"], "gzip");
        }
        assert!(req.headers().contains_key("host"));

        http::Response::default()
    });

    let url = format!("http://{}/1", server.addr());
    let res = client(Options::new(), &server).get(&url).send().await.unwrap();

    assert_eq!(res.url().as_str(), &url);
    assert_eq!(res.status(), rehttp::StatusCode::OK);
}

#[tokio::test]
async fn host_header_names_the_upstream() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        let host = req.headers()["host"].to_str().unwrap().to_owned();
        http::Response::new(Body::from(host))
    });

    let url = format!("http://{}/host", server.addr());
    let body = client(Options::new(), &server)
        .get(&url)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(body, server.addr().to_string());
}

#[tokio::test]
async fn user_agent_from_options() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.headers()[USER_AGENT], "rehttp-test-agent");
        http::Response::default()
    });

    let url = format!("http://{}/ua", server.addr());
    let res = client(Options::new().user_agent("rehttp-test-agent"), &server)
        .get(&url)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), rehttp::StatusCode::OK);
}

#[tokio::test]
async fn user_agent_set_on_request_wins() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.headers()[USER_AGENT], "per-request");
        assert_eq!(req.headers().get_all(USER_AGENT).iter().count(), 1);
        http::Response::default()
    });

    let url = format!("http://{}/ua", server.addr());
    let res = client(Options::new(), &server)
        .get(&url)
        .header(USER_AGENT, "per-request")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), rehttp::StatusCode::OK);
}

#[tokio::test]
async fn extra_default_headers() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["x-service"], "billing");
        http::Response::default()
    });

    let options = Options::new().header("x-service", "billing").unwrap();
    let url = format!("http://{}/", server.addr());
    client(options, &server).get(&url).send().await.unwrap();
}

#[tokio::test]
async fn body_content_length() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "POST");
        assert_eq!(req.headers()[CONTENT_LENGTH], "5");

        let body = http_body_util::BodyExt::collect(req.into_body())
            .await
            .unwrap()
            .to_bytes();
        http::Response::new(Body::from(body))
    });

    let url = format!("http://{}/echo", server.addr());
    let text = client(Options::new(), &server)
        .post(&url)
        .body("hello")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(text, "hello");
}

#[tokio::test]
async fn streaming_body_is_chunked() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert!(req.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(req.headers()["transfer-encoding"], "chunked");

        let body = http_body_util::BodyExt::collect(req.into_body())
            .await
            .unwrap()
            .to_bytes();
        http::Response::new(Body::from(body))
    });

    let chunks: Vec<Result<&'static str, std::io::Error>> = vec![Ok("he"), Ok("llo")];
    let body = Body::wrap_stream(futures_util::stream::iter(chunks));

    let url = format!("http://{}/echo", server.addr());
    let text = client(Options::new(), &server)
        .put(&url)
        .body(body)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(text, "hello");
}

#[tokio::test]
async fn new_request_then_execute() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "DELETE");
        assert_eq!(req.uri().path(), "/items/7");
        assert_eq!(req.uri().query(), Some("force=true"));
        http::Response::builder()
            .status(204)
            .body(Body::default())
            .unwrap()
    });

    let client = client(Options::new(), &server);
    let url = format!("http://{}/items/7?force=true", server.addr());
    let req = client.new_request(Method::DELETE, &url, None).unwrap();
    let res = client.execute(req).await.unwrap();

    assert_eq!(res.status(), 204);
}

#[tokio::test]
async fn round_trip_sends_headers_as_given() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert!(req.headers().get(USER_AGENT).is_none());
        http::Response::default()
    });

    let client = client(Options::new(), &server);
    let url = format!("http://{}/raw", server.addr());
    let req = rehttp::Request::new(Method::GET, url.parse().unwrap());

    let res = client.round_trip(req).await.unwrap();
    assert_eq!(res.status(), rehttp::StatusCode::OK);
}

#[tokio::test]
async fn connection_is_reused() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move { http::Response::new(Body::from("pong")) });

    // A single slot makes the second request wait for the first connection.
    let client = client(Options::new().pool_max_size(1), &server);
    let url = format!("http://{}/ping", server.addr());

    for _ in 0..3 {
        let text = client.get(&url).send().await.unwrap().text().await.unwrap();
        assert_eq!(text, "pong");
    }

    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn zero_max_idle_keeps_reusing_connections() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move { http::Response::new(Body::from("pong")) });

    let client = client(
        Options::new().pool_max_size(1).max_idle_conns_per_host(0),
        &server,
    );
    let url = format!("http://{}/ping", server.addr());

    for _ in 0..3 {
        let text = client.get(&url).send().await.unwrap().text().await.unwrap();
        assert_eq!(text, "pong");
    }

    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn keep_alives_disabled() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move { http::Response::new(Body::from("pong")) });

    let client = client(
        Options::new().pool_max_size(1).disable_keep_alives(true),
        &server,
    );
    let url = format!("http://{}/ping", server.addr());

    for _ in 0..2 {
        client.get(&url).send().await.unwrap().text().await.unwrap();
    }

    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn pool_bypass_dials_every_request() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move { http::Response::default() });

    let client = client(Options::new().pool_max_size(0), &server);
    let url = format!("http://{}/", server.addr());

    for _ in 0..2 {
        client.get(&url).send().await.unwrap().bytes().await.unwrap();
    }

    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn warm_up_dials_initial_connections() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move { http::Response::default() });

    let client = Client::new(
        Options::new().pool_initial_size(2),
        "127.0.0.1",
        server.port(),
    )
    .unwrap();
    client.warm_up().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.accepted(), 2);

    let url = format!("http://{}/", server.addr());
    client.get(&url).send().await.unwrap();
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn concurrent_requests_share_a_bounded_pool() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        http::Response::new(Body::from("ok"))
    });

    let client = client(Options::new().pool_max_size(2), &server);
    let url = format!("http://{}/", server.addr());

    let tasks = (0..6).map(|_| {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move { client.get(&url).send().await?.text().await })
    });

    for task in tasks.collect::<Vec<_>>() {
        assert_eq!(task.await.unwrap().unwrap(), "ok");
    }

    assert!(server.accepted() <= 2);
}

#[tokio::test]
async fn response_head_and_version() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "HEAD");
        http::Response::builder()
            .header("x-answer", "42")
            .body(Body::default())
            .unwrap()
    });

    let url = format!("http://{}/", server.addr());
    let res = client(Options::new(), &server).head(&url).send().await.unwrap();

    assert_eq!(res.version(), rehttp::Version::HTTP_11);
    assert_eq!(res.headers()["x-answer"], "42");
}

#[tokio::test]
async fn client_as_service() {
    use tower_service::Service;

    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.uri().path(), "/svc");
        http::Response::new(Body::from("served"))
    });

    let mut client = client(Options::new(), &server);
    let url = format!("http://{}/svc", server.addr());
    let req = client.get(&url).build().unwrap();

    futures_util::future::poll_fn(|cx| Service::<rehttp::Request>::poll_ready(&mut client, cx))
        .await
        .unwrap();
    let res = Service::call(&mut client, req).await.unwrap();
    assert_eq!(res.text().await.unwrap(), "served");

    let req = client.get(&url).build().unwrap();
    let res = Service::call(&mut &client, req).await.unwrap();
    assert_eq!(res.status(), rehttp::StatusCode::OK);
}

#[test]
fn client_without_runtime() {
    // Pre-warming needs a runtime, construction does not.
    let client = Client::new(Options::new(), "127.0.0.1", 8080).unwrap();
    assert!(format!("{client:?}").contains("Client"));
}

#[test]
fn invalid_upstream_address() {
    let err = Client::new(Options::new(), "", 8080).unwrap_err();
    assert!(err.is_builder());
}
