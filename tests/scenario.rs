mod common;

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use tokio::io::AsyncWriteExt;
use weft::{App, Body, Config, ContentType, HandlerError, Json, Params, Request, Response, Router, Status};

use common::{get, hello_router, hyper_client, parse, read_response, send, serve_duplex};

#[tokio::test]
async fn hello_scenario_through_app_handle() {
    let app = App::new(hello_router(), Config::default());

    let res = app.handle(parse(b"GET /hello/world HTTP/1.1\r\n\r\n")).await;
    assert_eq!(res.status_code(), Status::OK);
    assert_eq!(res.header("content-type"), Some("application/json"));
    let body: serde_json::Value = serde_json::from_slice(res.body().as_bytes().unwrap()).unwrap();
    assert_eq!(body, serde_json::json!({ "msg": "hi world" }));

    let res = app.handle(parse(b"POST /hello/world HTTP/1.1\r\ncontent-length: 0\r\n\r\n")).await;
    assert_eq!(res.status_code(), Status::METHOD_NOT_ALLOWED);

    let res = app.handle(parse(b"GET /unknown HTTP/1.1\r\n\r\n")).await;
    assert_eq!(res.status_code(), Status::NOT_FOUND);
}

#[tokio::test]
async fn hello_scenario_through_a_conformant_client() {
    let app = Arc::new(App::new(hello_router(), Config::default()));
    let mut client = hyper_client(serve_duplex(app)).await;

    let (parts, body) = send(&mut client, get("/hello/world")).await;
    assert_eq!(parts.status, http::StatusCode::OK);
    assert_eq!(parts.headers["content-type"], "application/json");
    assert_eq!(parts.headers["content-length"], body.len().to_string().as_str());
    assert_eq!(body, Bytes::from_static(br#"{"msg":"hi world"}"#));

    // same connection: keep-alive
    let post = http::Request::post("/hello/world").body(Full::new(Bytes::new())).unwrap();
    let (parts, _) = send(&mut client, post).await;
    assert_eq!(parts.status, http::StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(parts.headers["allow"], "GET, HEAD");

    let (parts, _) = send(&mut client, get("/unknown")).await;
    assert_eq!(parts.status, http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chunked_responses_reassemble_in_a_conformant_client() {
    async fn numbers(_req: Request, _params: Params) -> Response {
        let (tx, body) = Body::channel(2);
        tokio::spawn(async move {
            for i in 0..100 {
                if tx.send(format!("{i},")).await.is_err() {
                    return;
                }
            }
        });
        Response::stream(ContentType::Csv, body)
    }

    let app = Arc::new(App::new(Router::new().get("/numbers", numbers), Config::default()));
    let mut client = hyper_client(serve_duplex(app)).await;

    let (parts, body) = send(&mut client, get("/numbers")).await;
    assert_eq!(parts.status, http::StatusCode::OK);
    assert_eq!(parts.headers["transfer-encoding"], "chunked");
    assert_eq!(parts.headers["content-type"], "text/csv");

    let expected: String = (0..100).map(|i| format!("{i},")).collect();
    assert_eq!(body, Bytes::from(expected));

    // the connection survives a chunked response
    let (parts, _) = send(&mut client, get("/numbers")).await;
    assert_eq!(parts.status, http::StatusCode::OK);
}

#[tokio::test]
async fn json_request_bodies_and_query_strings() {
    #[derive(serde::Deserialize, serde::Serialize)]
    struct Item {
        name: String,
        qty: u32,
    }

    async fn create(req: Request, _params: Params) -> Result<(Status, String), HandlerError> {
        let item: Item = req.json()?;
        let note = req.query("note").unwrap_or("none");
        Ok((Status::CREATED, format!("{} x{} ({note})", item.name, item.qty)))
    }

    async fn echo(req: Request, _params: Params) -> Result<Json<Item>, HandlerError> {
        Ok(Json(req.json()?))
    }

    let router = Router::new().post("/items", create).put("/items", echo);
    let app = Arc::new(App::new(router, Config::default()));
    let mut client = hyper_client(serve_duplex(app)).await;

    let req = http::Request::post("/items?note=rush%20order")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(br#"{"name":"bolt","qty":3}"#)))
        .unwrap();
    let (parts, body) = send(&mut client, req).await;
    assert_eq!(parts.status, http::StatusCode::CREATED);
    assert_eq!(body, Bytes::from_static(b"bolt x3 (rush order)"));

    let req = http::Request::put("/items")
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from_static(b"bolt")))
        .unwrap();
    let (parts, body) = send(&mut client, req).await;
    assert_eq!(parts.status, http::StatusCode::BAD_REQUEST);
    assert_eq!(body, Bytes::from_static(b"unsupported content-type: text/plain"));

    let req = http::Request::put("/items")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(br#"{"name":"nut","qty":7}"#)))
        .unwrap();
    let (parts, body) = send(&mut client, req).await;
    assert_eq!(parts.status, http::StatusCode::OK);
    assert_eq!(body, Bytes::from_static(br#"{"name":"nut","qty":7}"#));
}

#[tokio::test]
async fn missing_parameter_is_a_bad_request() {
    async fn wrong_name(_req: Request, params: Params) -> Result<String, HandlerError> {
        Ok(params.require("id")?.to_owned())
    }

    let app = App::new(Router::new().get("/users/{user}", wrong_name), Config::default());
    let res = app.handle(parse(b"GET /users/7 HTTP/1.1\r\n\r\n")).await;
    assert_eq!(res.status_code(), Status::BAD_REQUEST);
    assert_eq!(res.body().as_bytes(), Some(&b"missing argument: id"[..]));
}

#[tokio::test]
async fn header_values_from_the_query_cannot_inject_lines() {
    async fn bounce(req: Request, _params: Params) -> Response {
        Response::redirect(req.query("next").unwrap_or("/"))
    }

    let app = Arc::new(App::new(Router::new().get("/r", bounce), Config::default()));
    let mut io = serve_duplex(app);

    io.write_all(b"GET /r?next=%2Fa%0D%0Aset-cookie%3A%20pwned%3D1 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let res = read_response(&mut io).await;
    assert!(res.starts_with("HTTP/1.1 302 Found\r\n"), "{res:?}");
    assert!(!res.contains("set-cookie"), "{res:?}");
    assert!(!res.contains("location"), "{res:?}");

    // the connection is still in sync
    io.write_all(b"GET /r?next=%2Fhome HTTP/1.1\r\n\r\n").await.unwrap();
    assert!(read_response(&mut io).await.contains("location: /home\r\n"));
}
