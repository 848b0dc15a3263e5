// ===============================
// src/testutil.rs (stub HTTP servers for client tests)
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};

pub type Handler = Arc<dyn Fn(&str, &str) -> (u16, String) + Send + Sync>;

/// Serve `handler(path_and_query, body) -> (status, body)` on an ephemeral port.
pub fn spawn_stub<F>(handler: F) -> SocketAddr
where
    F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
{
    let handler: Handler = Arc::new(handler);
    let make_svc = make_service_fn(move |_conn| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let handler = handler.clone();
                async move {
                    let path = req.uri().path_and_query().map(|p| p.to_string()).unwrap_or_default();
                    let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
                    let (code, body) = handler(&path, &String::from_utf8_lossy(&bytes));
                    let rsp = Response::builder()
                        .status(code)
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .unwrap();
                    Ok::<_, Infallible>(rsp)
                }
            }))
        }
    });
    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

/// An address nothing listens on.
pub fn closed_addr() -> SocketAddr {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = l.local_addr().unwrap();
    drop(l);
    addr
}
