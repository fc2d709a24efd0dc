use std::time::Instant;

use crate::LOG;

/// Log every request with its status and duration
#[derive(Debug, Default, Clone)]
pub struct LogMiddleware {
    _priv: (),
}

impl LogMiddleware {
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(&self, req: tide::Request<State>, next: tide::Next<'_, State>) -> tide::Result {
        let method = req.method().to_string();
        let path = req.url().path().to_string();
        let start = Instant::now();
        let resp = next.run(req).await;
        let status = resp.status() as u16;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if let Some(err) = resp.error() {
            slog::error!(
                LOG, "request error";
                "method" => &method,
                "path" => &path,
                "status" => status,
                "error" => err.to_string(),
            );
        } else if status >= 500 {
            slog::warn!(
                LOG, "request";
                "method" => &method,
                "path" => &path,
                "status" => status,
                "elapsed_ms" => elapsed_ms,
            );
        } else {
            slog::info!(
                LOG, "request";
                "method" => &method,
                "path" => &path,
                "status" => status,
                "elapsed_ms" => elapsed_ms,
            );
        }
        Ok(resp)
    }
}
