use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use contracts::config::SessionLimits;
use session_api::{serve, RoomService, ScriptedDocumentModel};
use session_core::analyzer;

const DEFAULT_SQLITE_PATH: &str = "session_rooms.sqlite";

fn print_usage() {
    println!("session-cli <command>");
    println!("commands:");
    println!("  serve [addr]");
    println!("    default addr: 127.0.0.1:8080");
    println!("  analyze <file>");
    println!("  convert <room_id> <file>");
    println!("  status <room_id>");
    println!("environment:");
    println!("  SESSION_SQLITE_PATH  room store path (default: {DEFAULT_SQLITE_PATH})");
}

fn sqlite_path() -> String {
    env::var("SESSION_SQLITE_PATH")
        .ok()
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_string())
}

fn parse_socket_addr(value: Option<&String>) -> Result<SocketAddr, String> {
    let raw = value.map(String::as_str).unwrap_or("127.0.0.1:8080");
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

fn open_service() -> Result<Arc<RoomService>, String> {
    let model = Arc::new(ScriptedDocumentModel::new());
    RoomService::open_sqlite(sqlite_path(), model, SessionLimits::default())
        .map(Arc::new)
        .map_err(|err| format!("could not open room store: {err}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("serve") => match parse_socket_addr(args.get(2)) {
            Ok(addr) => {
                let service = match open_service() {
                    Ok(service) => service,
                    Err(err) => {
                        eprintln!("error: {err}");
                        std::process::exit(1);
                    }
                };
                println!("serving session api on http://{addr}");
                if let Err(err) = serve(addr, service).await {
                    eprintln!("server error: {err}");
                    std::process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        },
        Some("analyze") => {
            let Some(path) = args.get(2) else {
                eprintln!("error: missing file");
                print_usage();
                std::process::exit(2);
            };
            match std::fs::read_to_string(path) {
                Ok(document) => {
                    let report = analyzer::analyze(&document);
                    match serde_json::to_string_pretty(&report) {
                        Ok(rendered) => println!("{rendered}"),
                        Err(err) => {
                            eprintln!("error: could not render report: {err}");
                            std::process::exit(1);
                        }
                    }
                }
                Err(err) => {
                    eprintln!("error: could not read {path}: {err}");
                    std::process::exit(1);
                }
            }
        }
        Some("convert") => {
            let (Some(room_id), Some(path)) = (args.get(2), args.get(3)) else {
                eprintln!("error: convert requires <room_id> <file>");
                print_usage();
                std::process::exit(2);
            };
            let source = match std::fs::read_to_string(path) {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("error: could not read {path}: {err}");
                    std::process::exit(1);
                }
            };
            let service = match open_service() {
                Ok(service) => service,
                Err(err) => {
                    eprintln!("error: {err}");
                    std::process::exit(1);
                }
            };
            match service.request_conversion(room_id, &source).await {
                Ok(room) => {
                    println!("room {} conversion {}", room.room_id, room.conversion_status);
                }
                Err(err) => {
                    eprintln!("error: conversion request failed: {}", err.message);
                    std::process::exit(1);
                }
            }
            // Offline conversions finish quickly; wait for the terminal
            // status before exiting.
            for _ in 0..100 {
                match service.conversion_status(room_id).await {
                    Ok(Some(report)) if report.status.is_terminal() => {
                        println!("room {} conversion {}", room_id, report.status);
                        if let Some(error) = report.error {
                            println!("  reason: {} ({:?})", error.message, error.error_code);
                        }
                        if let Some(reference) = report.document_ref {
                            println!("  document: {reference}");
                        }
                        if let Some(reference) = report.validator_ref {
                            println!("  validator: {reference}");
                        }
                        return;
                    }
                    Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                    Err(err) => {
                        eprintln!("error: status check failed: {}", err.message);
                        std::process::exit(1);
                    }
                }
            }
            eprintln!("error: conversion did not reach a terminal status");
            std::process::exit(1);
        }
        Some("status") => {
            let Some(room_id) = args.get(2) else {
                eprintln!("error: missing room_id");
                print_usage();
                std::process::exit(2);
            };
            let service = match open_service() {
                Ok(service) => service,
                Err(err) => {
                    eprintln!("error: {err}");
                    std::process::exit(1);
                }
            };
            match service.conversion_status(room_id).await {
                Ok(Some(report)) => {
                    println!("room {} conversion {}", report.room_id, report.status);
                    if let Some(error) = report.error {
                        println!("  reason: {} ({:?})", error.message, error.error_code);
                    }
                }
                Ok(None) => {
                    eprintln!("error: room {room_id} does not exist");
                    std::process::exit(1);
                }
                Err(err) => {
                    eprintln!("error: {}", err.message);
                    std::process::exit(1);
                }
            }
        }
        _ => {
            print_usage();
        }
    }
}
