mod support;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use support::server;
use wirereq::{Body, Client, Error, Exchange, RequestOptions};

fn get(url: &str) -> http::Request<Body> {
    http::Request::builder()
        .method(http::Method::GET)
        .uri(url)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn simple_get() {
    let server = server::http(|_req| async {
        http::Response::builder()
            .header("server", "wirereq-test")
            .body(hyper::Body::from("hello"))
            .unwrap()
    });

    let client = Client::new(RequestOptions::default()).unwrap();
    let url = format!("http://{}/a", server.addr());
    let resp = client.send(get(&url)).await.unwrap();

    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(resp.proto(), "HTTP/1.1");
    assert_eq!(resp.headers().get("server").unwrap(), "wirereq-test");
    assert_eq!(resp.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn post_sends_body() {
    let server = server::http(|req| async {
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
        http::Response::new(hyper::Body::from(body))
    });

    let client = Client::new(RequestOptions::default()).unwrap();
    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(format!("http://{}/echo", server.addr()))
        .body(Body::from("ping"))
        .unwrap();

    let resp = client.send(request).await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "ping");
}

#[tokio::test]
async fn sequential_requests_reuse_the_connection() {
    let server = server::http(|_req| async {
        http::Response::new(hyper::Body::from("ok"))
    });

    let client = Client::new(RequestOptions::default()).unwrap();
    let url = format!("http://{}/reuse", server.addr());

    for _ in 0..3 {
        let resp = client.send(get(&url)).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        resp.text().await.unwrap();
        // let the dispatcher publish readiness again
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn disabled_redirects_return_the_response_verbatim() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_in_handler = hits.clone();
    let server = server::http(move |_req| {
        let hits = hits_in_handler.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            http::Response::builder()
                .status(302)
                .header("location", "/next")
                .body(hyper::Body::empty())
                .unwrap()
        }
    });

    let options = RequestOptions {
        max_redirect: -1,
        ..Default::default()
    };
    let client = Client::new(options).unwrap();
    let resp = client
        .send(get(&format!("http://{}/start", server.addr())))
        .await
        .unwrap();

    assert_eq!(resp.status(), http::StatusCode::FOUND);
    assert_eq!(resp.headers().get("location").unwrap(), "/next");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn order_headers_shape_the_wire() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let head = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut n = 0;
        loop {
            let read = sock.read(&mut buf[n..]).await.unwrap();
            assert!(read > 0, "peer closed before request head");
            n += read;
            if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    });

    let options = RequestOptions {
        order_headers: Some(vec![
            http::header::HeaderName::from_static("x-second"),
            http::header::HeaderName::from_static("x-first"),
        ]),
        ..Default::default()
    };
    let client = Client::new(options).unwrap();
    let request = http::Request::builder()
        .uri(format!("http://{addr}/ordered"))
        .header("x-first", "1")
        .header("x-second", "2")
        .body(Body::empty())
        .unwrap();
    client.send(request).await.unwrap();

    let raw = head.await.unwrap();
    let first = raw.find("x-first").expect("x-first on the wire");
    let second = raw.find("x-second").expect("x-second on the wire");
    assert!(
        second < first,
        "ordered header should precede: {raw:?}"
    );
}

#[tokio::test]
async fn refused_dials_exhaust_the_retry_budget() {
    let client = Client::new(RequestOptions::default()).unwrap();
    // port 1 on loopback: nothing listens there
    let err = client.send(get("http://127.0.0.1:1/")).await.unwrap_err();
    assert!(err.is_retry_exhausted(), "got {err:?}");
}

#[tokio::test]
async fn err_callback_makes_dial_failures_terminal() {
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_cb = seen.clone();
    let options = RequestOptions {
        err_callback: Some(Arc::new(move |_ex: &mut Exchange, err: &Error| {
            seen_in_cb.fetch_add(1, Ordering::SeqCst);
            assert!(err.is_connect());
            Err(Error::aborted("this endpoint never answers"))
        })),
        ..Default::default()
    };
    let client = Client::new(options).unwrap();
    let err = client.send(get("http://127.0.0.1:1/")).await.unwrap_err();
    // the callback's error surfaces as-is, after exactly one dial
    assert!(err.is_callback(), "got {err:?}");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_callback_use_last_response_short_circuits() {
    let options = RequestOptions {
        request_callback: Some(Arc::new(|_ex: &mut Exchange| {
            Err(Error::use_last_response())
        })),
        ..Default::default()
    };
    let client = Client::new(options).unwrap();
    // no response stored yet: the sentinel is an error
    let err = client.send(get("http://127.0.0.1:1/")).await.unwrap_err();
    assert!(err.is_callback(), "got {err:?}");
}

#[tokio::test]
async fn closed_client_makes_no_exchanges() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_in_handler = hits.clone();
    let server = server::http(move |_req| {
        let hits = hits_in_handler.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            http::Response::new(hyper::Body::empty())
        }
    });

    let client = Client::new(RequestOptions::default()).unwrap();
    client.close();
    let err = client
        .send(get(&format!("http://{}/", server.addr())))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("closed"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn logger_receives_structured_events() {
    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = events.clone();
    let server = server::http(|_req| async {
        http::Response::new(hyper::Body::from("ok"))
    });

    let options = RequestOptions {
        logger: Some(Arc::new(move |event: wirereq::LogEvent| {
            sink.lock().unwrap().push(event.kind);
        })),
        ..Default::default()
    };
    let client = Client::new(options).unwrap();
    client
        .send(get(&format!("http://{}/", server.addr())))
        .await
        .unwrap();

    let kinds = events.lock().unwrap().clone();
    assert!(kinds.contains(&wirereq::LogKind::TcpConnect), "got {kinds:?}");
    assert!(kinds.contains(&wirereq::LogKind::ResponseHeaders), "got {kinds:?}");
}
