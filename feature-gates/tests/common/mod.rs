use std::net::SocketAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use feature_gates::api::auth::{USER_EMAIL_HEADER, USER_ID_HEADER, USER_ROLE_HEADER};
use feature_gates::config::Config;
use feature_gates::server::serve;

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(Config::default_test_config);

/// Identity forwarded by the upstream auth layer.
#[derive(Clone, Copy)]
pub struct Caller {
    pub id: &'static str,
    pub email: Option<&'static str>,
    pub role: Option<&'static str>,
}

pub const ADMIN: Caller = Caller {
    id: "admin-1",
    email: Some("ops@listings.example"),
    role: Some("admin"),
};

pub const USER: Caller = Caller {
    id: "user-1",
    email: Some("jane@example.com"),
    role: Some("user"),
};

pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    client: reqwest::Client,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await }).await
        });
        ServerHandle {
            addr,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        caller: Option<Caller>,
        body: Option<Value>,
    ) -> reqwest::Response {
        let mut request = self
            .client
            .request(method, format!("http://{:?}{}", self.addr, path));

        if let Some(caller) = caller {
            request = request.header(USER_ID_HEADER, caller.id);
            if let Some(email) = caller.email {
                request = request.header(USER_EMAIL_HEADER, email);
            }
            if let Some(role) = caller.role {
                request = request.header(USER_ROLE_HEADER, role);
            }
        }
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        request.send().await.expect("failed to send request")
    }

    pub async fn get(&self, path: &str, caller: Option<Caller>) -> reqwest::Response {
        self.send(Method::GET, path, caller, None).await
    }

    pub async fn create_flag(&self, body: Value) -> reqwest::Response {
        self.send(Method::POST, "/flags", Some(ADMIN), Some(body))
            .await
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
