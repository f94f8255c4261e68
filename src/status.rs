// ABOUTME: Small HTTP endpoint exposing run progress as JSON
// ABOUTME: Lets a browser or script poll the status board and request a stop

use crate::errors::{IllustratorError, Result};
use crate::progress::{StatusBoard, StopFlag};
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

/// Running status server; stops when dropped.
pub struct StatusServer {
    server: Arc<Server>,
    addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl StatusServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Status server thread panicked");
            }
        }
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve `board` on `127.0.0.1:port` (port 0 picks a free one).
///
/// Routes: `GET /api/progress`, `GET /api/health`, `POST /api/stop`.
pub fn serve(board: StatusBoard, stop: StopFlag, port: u16) -> Result<StatusServer> {
    let server = Server::http(("127.0.0.1", port)).map_err(|e| {
        IllustratorError::StatusServerError(format!("Failed to start HTTP server: {}", e))
    })?;
    let addr = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| IllustratorError::StatusServerError("not bound to an IP".to_string()))?;

    let server = Arc::new(server);
    let worker = Arc::clone(&server);
    let handle = thread::spawn(move || {
        for request in worker.incoming_requests() {
            handle_request(request, &board, &stop);
        }
        debug!("Status server loop finished");
    });

    info!("Status available at http://{}/api/progress", addr);
    Ok(StatusServer {
        server,
        addr,
        handle: Some(handle),
    })
}

fn json_header() -> Option<Header> {
    Header::from_bytes("Content-Type", "application/json").ok()
}

fn respond_json(request: Request, status: u16, body: String) {
    let mut response = Response::from_string(body).with_status_code(StatusCode(status));
    if let Some(header) = json_header() {
        response = response.with_header(header);
    }
    if let Err(e) = request.respond(response) {
        error!("Failed to send response: {}", e);
    }
}

fn handle_request(request: Request, board: &StatusBoard, stop: &StopFlag) {
    let method = request.method().clone();
    let path = request.url().split('?').next().unwrap_or("").to_string();
    debug!("Status request {} {}", method, path);

    match (&method, path.as_str()) {
        (Method::Get, "/api/progress") => respond_json(request, 200, board.to_json()),
        (Method::Get, "/api/health") => {
            respond_json(request, 200, r#"{"status":"ok"}"#.to_string())
        }
        (Method::Post, "/api/stop") => {
            stop.request_stop();
            info!("Stop requested over HTTP");
            respond_json(request, 200, r#"{"status":"stopping"}"#.to_string())
        }
        _ => respond_json(request, 404, r#"{"error":"not found"}"#.to_string()),
    }
}
