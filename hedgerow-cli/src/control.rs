//! Read-only HTTP control surface: `/status`, `/health`, `/simulate`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use hedgerow_engine::{HealthcheckService, OrderManager, PairRegistry};
use hyper::body::Body;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Method, Request, Response, StatusCode};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct ControlState {
    pub started_at: Instant,
    pub pair_count: usize,
    pub manager: Arc<OrderManager>,
    pub registry: Arc<PairRegistry>,
    pub healthcheck: Arc<HealthcheckService>,
}

pub fn spawn_control_server(state: Arc<ControlState>, addr: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(route(&state, &req).await) }
                }))
            }
        });
        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "control server terminated");
        } else {
            info!(%addr, "control server shutdown");
        }
    })
}

async fn route(state: &ControlState, req: &Request<Body>) -> Response<Body> {
    let path = req.uri().path();
    match (req.method(), path) {
        (&Method::GET, "/status") => status(state),
        (&Method::GET, "/health") => health(state).await,
        (method, _) if path.starts_with("/simulate/") => {
            if method == Method::GET || method == Method::POST {
                simulate(state, req).await
            } else {
                not_found()
            }
        }
        _ => not_found(),
    }
}

fn status(state: &ControlState) -> Response<Body> {
    let open_orders = state.manager.open_orders();
    let pairs: Vec<serde_json::Value> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(pair_id, disabled, last_fill)| {
            json!({
                "pair_id": pair_id,
                "disabled": disabled,
                "last_fill": last_fill.map(|ts| ts.to_rfc3339()),
            })
        })
        .collect();
    let body = json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "pair_count": state.pair_count,
        "open_orders": open_orders.len(),
        "pairs": pairs,
    });
    json_response(StatusCode::OK, &body)
}

async fn health(state: &ControlState) -> Response<Body> {
    let report = state.healthcheck.health().await;
    let all_ok = report.iter().all(|pair| pair.is_ok());
    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "ok": all_ok,
        "pairs": report,
    });
    json_response(status, &body)
}

async fn simulate(state: &ControlState, req: &Request<Body>) -> Response<Body> {
    let pair_id = req
        .uri()
        .path()
        .trim_start_matches("/simulate/")
        .to_string();
    if pair_id.is_empty() {
        return bad_request("missing pair id");
    }
    let size = match parse_size(req.uri().query()) {
        Ok(size) => size,
        Err(message) => return bad_request(&message),
    };
    match state.healthcheck.simulate(&pair_id, size).await {
        Ok(run) => json_response(
            StatusCode::OK,
            &json!({
                "id": run.id,
                "pair_id": run.pair_id,
                "size": run.size.to_string(),
                "expected_pnl": run.expected_pnl.to_string(),
                "plan": run.plan,
            }),
        ),
        Err(err) => json_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            &json!({ "error": err.to_string() }),
        ),
    }
}

fn parse_size(query: Option<&str>) -> Result<Option<Decimal>, String> {
    let Some(query) = query else {
        return Ok(None);
    };
    for param in query.split('&') {
        if let Some(raw) = param.strip_prefix("size=") {
            return Decimal::from_str(raw)
                .map(Some)
                .map_err(|_| format!("invalid size '{raw}'"));
        }
    }
    Ok(None)
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn bad_request(message: &str) -> Response<Body> {
    json_response(StatusCode::BAD_REQUEST, &json!({ "error": message }))
}

fn not_found() -> Response<Body> {
    json_response(StatusCode::NOT_FOUND, &json!({ "error": "not found" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn size_parameter_is_optional() {
        assert_eq!(parse_size(None).unwrap(), None);
        assert_eq!(parse_size(Some("foo=1")).unwrap(), None);
        assert_eq!(parse_size(Some("size=25")).unwrap(), Some(dec!(25)));
        assert!(parse_size(Some("size=lots")).is_err());
    }
}
