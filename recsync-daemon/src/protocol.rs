use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
}

impl DaemonRequest {
    pub fn new(cmd: &str, job: Option<String>) -> Self {
        Self {
            cmd: cmd.to_string(),
            job,
        }
    }
}

/// JSON newline-delimited response.
///
/// A `run` streams any number of `log` lines before its final response;
/// every other command answers with exactly one line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            log: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            log: None,
        }
    }

    pub fn log_line(line: impl Into<String>) -> Self {
        Self {
            ok: true,
            data: None,
            error: None,
            log: Some(line.into()),
        }
    }

    pub fn is_log(&self) -> bool {
        self.log.is_some()
    }
}

/// Send one request and hand every streamed log line to `on_log` until the
/// final response arrives.
pub fn send_request_streaming(
    home: &Path,
    request: &DaemonRequest,
    mut on_log: impl FnMut(&str),
) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| io_err(&socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(
                "daemon closed connection before responding".to_string(),
            ));
        }
        let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
        match response.log {
            Some(ref log) => on_log(log),
            None => return Ok(response),
        }
    }
}

/// Send one JSON request to the daemon socket and return its response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    send_request_streaming(home, request, |_| {})
}

/// Retries briefly so a freshly started daemon has time to bind its socket.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status", None);

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::new("stop", None))?;
    response_into_data(response).map(|_| ())
}

/// Ask the daemon to latch cancellation for `job`. The returned data carries
/// `cancelled: false` when the job was not running.
pub fn request_cancel(home: &Path, job: &str) -> Result<Value, DaemonError> {
    let response = send_request(home, &DaemonRequest::new("cancel", Some(job.to_string())))?;
    response_into_data(response)
}

/// Run `job` inside the daemon, streaming its progress to `on_log`.
pub fn request_run(
    home: &Path,
    job: &str,
    on_log: impl FnMut(&str),
) -> Result<Value, DaemonError> {
    let response = send_request_streaming(
        home,
        &DaemonRequest::new("run", Some(job.to_string())),
        on_log,
    )?;
    response_into_data(response)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
