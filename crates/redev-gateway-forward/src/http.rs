use std::io::Read;
use std::time::Duration;

use redev_gateway_core::{BackendReply, BackendTransport, ForwardPlan, GatewayError, PlanBody};
use tracing::{debug, warn};

use crate::{encode_multipart, BackendConfig};

/// Replies larger than this are refused rather than relayed in part.
pub const MAX_REPLY_BYTES: u64 = 8 * 1024 * 1024;

/// Blocking HTTP transport to the backend of record.
///
/// Redirects are not followed; a 3xx from the backend is relayed like any
/// other reply.
#[derive(Debug, Clone)]
pub struct UreqTransport {
    config: BackendConfig,
    agent: ureq::Agent,
}

impl UreqTransport {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms()))
            .redirects(0)
            .build();
        Self { config, agent }
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

impl BackendTransport for UreqTransport {
    fn dispatch(&self, plan: &ForwardPlan) -> Result<BackendReply, GatewayError> {
        let url = self.config.url_for(plan.route);
        let mut request = self.agent.request(plan.method.as_str(), &url);
        for (key, value) in &plan.query {
            request = request.query(key, value);
        }
        for (name, value) in plan.headers.iter() {
            request = request.set(name, value);
        }

        let sent = match &plan.body {
            PlanBody::Empty => request.call(),
            PlanBody::Json(value) => request.send_json(value),
            PlanBody::Multipart(form) => {
                let encoded = encode_multipart(form, &format!("redev-gateway-{}", plan.request_id));
                request
                    .set("content-type", &encoded.content_type)
                    .send_bytes(&encoded.body)
            }
        };

        let response = match sent {
            Ok(response) | Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(err)) => {
                warn!(
                    request_id = %plan.request_id,
                    route = plan.route,
                    error = %err,
                    "backend unreachable"
                );
                return Err(GatewayError::BackendUnavailable(format!(
                    "{} {}: {err}",
                    plan.method.as_str(),
                    plan.route
                )));
            }
        };

        let status = response.status();
        let content_type = response.header("content-type").map(str::to_string);
        let mut body = Vec::new();
        if let Err(err) = response
            .into_reader()
            .take(MAX_REPLY_BYTES + 1)
            .read_to_end(&mut body)
        {
            return Err(GatewayError::BackendUnavailable(format!(
                "reading reply from {}: {err}",
                plan.route
            )));
        }
        if u64::try_from(body.len()).unwrap_or(u64::MAX) > MAX_REPLY_BYTES {
            warn!(
                request_id = %plan.request_id,
                route = plan.route,
                status,
                "backend reply exceeds size limit"
            );
            return Err(GatewayError::BackendUnavailable(format!(
                "reply from {} exceeds {MAX_REPLY_BYTES} bytes",
                plan.route
            )));
        }
        debug!(
            request_id = %plan.request_id,
            route = plan.route,
            status,
            bytes = body.len(),
            "backend replied"
        );
        Ok(BackendReply::new(status, content_type, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    use redev_gateway_core::{AccessGateway, Operation, OperationInputs, Session};

    fn auth_me_plan() -> ForwardPlan {
        match AccessGateway::new().handle(
            None,
            Operation::AuthMe,
            &OperationInputs::new(),
            &Session::from_token("tok"),
        ) {
            Ok(plan) => plan,
            Err(err) => panic!("auth/me not admitted: {err}"),
        }
    }

    /// Answers a single request with `body` and returns the base url.
    fn serve_once(body: Vec<u8>) -> (String, thread::JoinHandle<()>) {
        let listener = match TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) => panic!("failed to bind test listener: {err}"),
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => panic!("listener has no address: {err}"),
        };
        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => return,
                    Ok(read) => request.extend_from_slice(&chunk[..read]),
                }
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            // The client may hang up once it has read past the limit.
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
        });
        (format!("http://{addr}"), handle)
    }

    fn transport_for(base_url: &str) -> UreqTransport {
        match BackendConfig::new(base_url, 5_000) {
            Ok(config) => UreqTransport::new(config),
            Err(err) => panic!("config rejected: {err}"),
        }
    }

    fn json_string_of_len(len: usize) -> Vec<u8> {
        let mut body = Vec::with_capacity(len);
        body.push(b'"');
        body.resize(len - 1, b'a');
        body.push(b'"');
        body
    }

    #[test]
    fn reply_within_limit_is_returned_byte_for_byte() {
        let body = b"{ \"user\" : {\"id\": \"u-1\"} }".to_vec();
        let (base_url, server) = serve_once(body.clone());
        let reply = match transport_for(&base_url).dispatch(&auth_me_plan()) {
            Ok(reply) => reply,
            Err(err) => panic!("expected reply, got {err}"),
        };
        let _ = server.join();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, body);
    }

    #[test]
    fn oversized_reply_is_refused_instead_of_truncated() {
        let len = usize::try_from(MAX_REPLY_BYTES).unwrap_or(usize::MAX) + 1_035;
        let (base_url, server) = serve_once(json_string_of_len(len));
        let result = transport_for(&base_url).dispatch(&auth_me_plan());
        let _ = server.join();
        match result {
            Ok(reply) => panic!("expected refusal, got {} bytes", reply.body.len()),
            Err(err) => {
                assert_eq!(err.code(), "backend_unavailable");
                assert!(err.to_string().contains("exceeds"), "{err}");
            }
        }
    }

    #[test]
    fn unreachable_backend_is_reported_as_unavailable() {
        // Port 9 (discard) on loopback is closed in test environments.
        let config = match BackendConfig::new("http://127.0.0.1:9", 500) {
            Ok(config) => config,
            Err(err) => panic!("config rejected: {err}"),
        };
        let transport = UreqTransport::new(config);
        let err = match transport.dispatch(&auth_me_plan()) {
            Ok(reply) => panic!("expected transport failure, got status {}", reply.status),
            Err(err) => err,
        };
        assert_eq!(err.code(), "backend_unavailable");
        assert_eq!(err.http_status(), 502);
    }
}
