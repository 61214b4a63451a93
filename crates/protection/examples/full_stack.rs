//! Example demonstrating the full protection coordinator wired in front of
//! a toy handler via `ProtectionLayer`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use protection::core::settings::ProtectionSettings;
use protection::coordinator::{
    ProtectionCoordinator, ProtectionLayer, RequestContext, RequestContextSource, ResponseStatusSource,
};
use tower::{Service, ServiceBuilder, ServiceExt};

#[derive(Clone)]
struct ChatRequest {
    session_id: String,
}

impl RequestContextSource for ChatRequest {
    fn protection_context(&self) -> RequestContext {
        RequestContext {
            session_id: self.session_id.clone(),
            endpoint: "/api/v1/agent/query".to_string(),
            method: "POST".to_string(),
            payload_size: 32,
            body: Some(b"{\"query\":\"hello\"}".to_vec()),
            query_params: vec![],
            headers: vec![],
            client_ip: "203.0.113.7".to_string(),
            user_agent: Some("demo-client/1.0".to_string()),
        }
    }
}

struct ChatResponse {
    status: u16,
    body: String,
}

impl ResponseStatusSource for ChatResponse {
    fn protection_status_code(&self) -> u16 {
        self.status
    }
}

#[tokio::main]
async fn main() {
    let handled = Arc::new(AtomicUsize::new(0));
    let handled_clone = Arc::clone(&handled);

    let handler = tower::service_fn(move |req: ChatRequest| {
        let handled = Arc::clone(&handled_clone);
        async move {
            handled.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::convert::Infallible>(ChatResponse {
                status: 200,
                body: format!("echo: {}", req.session_id),
            })
        }
    });

    let coordinator = Arc::new(ProtectionCoordinator::new(ProtectionSettings::default()));
    let mut service = ServiceBuilder::new().layer(ProtectionLayer::new(coordinator)).service(handler);

    println!("Sending the same request twice from session 'demo':\n");

    for i in 1..=2 {
        match service.ready().await.unwrap().call(ChatRequest { session_id: "demo".to_string() }).await {
            Ok(response) => println!("Request {i}: {} ({})", response.body, response.status),
            Err(err) => println!("Request {i}: denied: {err}"),
        }
    }

    println!("\nRequests that reached the handler: {}", handled.load(Ordering::SeqCst));
}
