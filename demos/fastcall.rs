// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Level, LevelFilter, Logger};

use fast_protocol::{Client, FastConfig};

static APP: &'static str = "fastcall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 8080;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a Fast request or fire")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("UDP port for remote server (Default: 8080)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("route")
                .help("Route to call, e.g. /echo")
                .long("route")
                .short("r")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("data")
                .help("Payload to send (text or JSON)")
                .long("data")
                .short("d")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Per-attempt timeout in milliseconds (Default: 5000)")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("retries")
                .help("Retransmissions before giving up (Default: 3)")
                .long("retries")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("fire")
                .help("Send without waiting for a reply")
                .long("fire")
                .short("f")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let route = matches.value_of("route").unwrap_or_else(|| {
        eprintln!("Failed to parse route argument");
        process::exit(1)
    });
    let data = String::from(matches.value_of("data").unwrap_or(""));

    let mut config = FastConfig::default();
    if let Ok(ms) = value_t!(matches, "timeout", u64) {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }
    if let Ok(retries) = value_t!(matches, "retries", u32) {
        config = config.with_max_retries(retries);
    }

    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Warning
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    );

    let server = [host, String::from(":"), port.to_string()].concat();
    let client = Client::new(server, config, Some(&log));
    if let Err(e) = client.connect().await {
        eprintln!("Failed to connect: {}", e);
        process::exit(1)
    }

    let result = if matches.is_present("fire") {
        client.send(route, data).await.map(|_| None)
    } else {
        client.request(route, data).await.map(Some)
    };
    client.disconnect().await;

    match result {
        Ok(Some(reply)) => println!("{}", String::from_utf8_lossy(&reply)),
        Ok(None) => (),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    }
}
