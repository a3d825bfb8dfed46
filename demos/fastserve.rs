// Copyright 2020 Joyent, Inc.

use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::prelude::*;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{debug, error, info, o, Drain, Logger};

use fast_protocol::{Context, FastConfig, HandlerError, LoggingMiddleware, Response, Server};

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: i64,
    iso8601: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct SleepPayload {
    delay: Option<u64>,
    echo: Value,
}

fn date_handler(log: &Logger) -> Result<Response, HandlerError> {
    debug!(log, "handling date request");
    let now = Utc::now();
    Ok(Response::json(&DatePayload {
        timestamp: now.timestamp_millis(),
        iso8601: now,
    })?)
}

async fn sleep_handler(ctx: Context, log: Logger) -> Result<Response, HandlerError> {
    let payload: SleepPayload = ctx.json()?;
    debug!(log, "handling sleep request"; "delay" => payload.delay);
    if let Some(delay) = payload.delay {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Ok(Response::json(&json!({ "value": payload.echo }))?)
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let server = Arc::new(Server::new(FastConfig::default(), Some(&root_log)));

    let date_log = root_log.clone();
    let sleep_log = root_log.clone();
    let echo_log = root_log.clone();
    server
        .with_middleware(LoggingMiddleware::new(&root_log))
        .on_fn("/ping", |_ctx| Ok(Response::text("pong")))
        .on_fn("/echo", move |ctx| {
            debug!(echo_log, "handling echo request"; "peer" => %ctx.peer());
            Ok(Response::new(ctx.payload().clone()))
        })
        .on_fn("/json", |ctx| {
            let data: Value = ctx.json()?;
            Ok(Response::json(&json!({
                "message": "Received",
                "echo": data,
            }))?)
        })
        .on_fn("/uppercase", |ctx| Ok(Response::text(ctx.text()?.to_uppercase())))
        .on_fn("/reverse", |ctx| {
            let reversed: String = ctx.text()?.chars().rev().collect();
            Ok(Response::text(reversed))
        })
        .on_fn("/date", move |_ctx| date_handler(&date_log))
        .on("/sleep", move |ctx| sleep_handler(ctx, sleep_log.clone()));

    let stopper = Arc::clone(&server);
    let stop_log = root_log.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(stop_log, "interrupted, shutting down");
            stopper.stop();
        }
    });

    info!(root_log, "starting fast server"; "address" => &addr, "routes" => server.routes().join(","));
    if let Err(e) = server.listen(&addr).await {
        error!(root_log, "server failed"; "err" => %e);
        std::process::exit(1);
    }
}
