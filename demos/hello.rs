//! `cargo run --example hello`, then:
//!
//! ```text
//! curl localhost:9000/hello/world          → {"msg":"hi world"}
//! curl -X POST localhost:9000/hello/world  → 405
//! curl localhost:9000/ticks                → 5 chunks, one per 200 ms
//! ```

use std::time::Duration;

use serde::Serialize;
use weft::{Body, Config, ContentType, HandlerError, Json, Params, Request, Response, Router, Server};

#[derive(Serialize)]
struct Greeting {
    msg: String,
}

async fn hello(_req: Request, params: Params) -> Result<Json<Greeting>, HandlerError> {
    let name = params.require("name")?;
    Ok(Json(Greeting { msg: format!("hi {name}") }))
}

async fn ticks(_req: Request, _params: Params) -> Response {
    let (tx, body) = Body::channel(1);
    tokio::spawn(async move {
        for i in 0..5 {
            if tx.send(format!("tick {i}\n")).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });
    Response::stream(ContentType::Text, body)
}

#[tokio::main]
async fn main() -> Result<(), weft::Error> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let app = Router::new()
        .layer(weft::middleware::Trace)
        .get("/hello/{name}", hello)
        .get("/ticks", ticks)
        .on_error(|err| eprintln!("handler error: {err}"));

    Server::new(config).serve(app).await
}
