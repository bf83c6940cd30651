use gatekeep::{Config, FederationGateway, GraphQLRequest};

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Serves a unified GraphQL schema mounted from upstream services")]
struct Args {
    /// Gateway configuration (JSON, or YAML when the file ends in .yaml/.yml)
    #[arg(short, long, default_value = "gateway.json")]
    config: PathBuf,

    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:3000")]
    listen: SocketAddr,
}

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<FederationGateway>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let auth_headers = extract_auth_headers(req.headers());

    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok(plain(StatusCode::BAD_REQUEST, "Failed to read request body"));
                }
            };

            match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
                Ok(mut graphql_req) => {
                    graphql_req.auth_headers = auth_headers;

                    let response = gateway.process_request(graphql_req).await;
                    let json = serde_json::to_string(&response).unwrap_or_default();
                    Response::builder()
                        .header(CONTENT_TYPE, "application/json")
                        .header("Access-Control-Allow-Origin", "*")
                        .body(full(json))
                        .unwrap_or_else(|_| internal_server_error())
                }
                Err(e) => plain(StatusCode::BAD_REQUEST, format!("Invalid JSON request: {}", e)),
            }
        }

        (&Method::GET, "/schema") => Response::builder()
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .header("Access-Control-Allow-Origin", "*")
            .body(full(gateway.sdl()))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::OPTIONS, _) => Response::builder()
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header(
                "Access-Control-Allow-Headers",
                "Content-Type, Authorization, x-api-key, x-token",
            )
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(result)
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Access-Control-Allow-Origin", "*")
        .body(full(body))
        .unwrap_or_else(|_| internal_server_error())
}

fn internal_server_error() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

// Headers forwarded to every upstream call of the request
fn extract_auth_headers(headers: &HeaderMap) -> Option<HashMap<String, String>> {
    let mut auth_headers = HashMap::new();

    if let Some(auth_header) = headers.get(AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            auth_headers.insert("Authorization".to_string(), auth_str.to_string());
        }
    }

    for header_name in ["x-api-key", "x-token"].iter() {
        if let Some(header_value) = headers.get(*header_name) {
            if let Ok(value_str) = header_value.to_str() {
                auth_headers.insert(header_name.to_string(), value_str.to_string());
            }
        }
    }

    if auth_headers.is_empty() {
        None
    } else {
        Some(auth_headers)
    }
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;

    let gateway = match FederationGateway::new(config).await {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!("failed to start gateway: {}", e);
            return Err(e.into());
        }
    };

    let listener = TcpListener::bind(args.listen).await?;
    info!("GraphQL gateway listening on http://{}/graphql", args.listen);
    info!("unified schema available at http://{}/schema", args.listen);

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = TokioIo::new(stream);

        let gateway_clone = Arc::clone(&gateway);

        let executor = TokioExecutor;

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway_clone.clone();
                handle_request(req, gateway)
            });

            match hyper_util::server::conn::auto::Builder::new(executor)
                .serve_connection(io, service)
                .await
            {
                Ok(_) => debug!("connection closed"),
                Err(e) => error!("error processing connection: {}", e),
            }
        });
    }
}
