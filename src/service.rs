use crate::models::{RecordRest, UserStatus};
use crate::store::Store;
use crate::{Error, CONFIG, LOG};

#[derive(Clone)]
pub struct Context {
    store: Store,
}

pub fn app(store: Store) -> tide::Server<Context> {
    let ctx = Context { store };
    let mut app = tide::with_state(ctx);
    app.at("/status").get(status);
    app.at("/user/:username").post(add_user);
    app.at("/user/:username/records").get(user_records);
    app.at("/user/:username/status").get(user_status);
    app.with(crate::logging::LogMiddleware::new());
    app
}

pub async fn start(store: Store) -> crate::Result<()> {
    let app = app(store);
    slog::info!(LOG, "running at {}", CONFIG.listen_addr());
    app.listen(CONFIG.listen_addr()).await?;
    Ok(())
}

async fn status(req: tide::Request<Context>) -> tide::Result {
    match req.state().store.get_system_info() {
        Ok(info) => Ok(resp!(json => info)),
        Err(e) => {
            slog::error!(LOG, "error loading system info {}", e);
            Ok(resp!(status => 500, message => "Cannot get status"))
        }
    }
}

/// Registers a user for syncing, their history is picked up on the
/// next sync tick
async fn add_user(req: tide::Request<Context>) -> tide::Result {
    let username = req.param("username")?;
    match req.state().store.add_user(username) {
        Ok(()) => {
            slog::info!(LOG, "registered user {}", username);
            Ok(resp!(json => serde_json::json!({ "username": username })))
        }
        Err(e @ Error::UserExists(_)) => {
            Ok(resp!(status => 400, message => e.to_string()))
        }
        Err(e) => {
            slog::error!(LOG, "error registering user {} {}", username, e);
            Ok(resp!(status => 500, message => "Cannot add user"))
        }
    }
}

/// A user's full history, newest first
async fn user_records(req: tide::Request<Context>) -> tide::Result {
    let username = req.param("username")?;
    let mut records = match req.state().store.get_records(username) {
        Ok(records) => records,
        Err(e) => {
            slog::error!(LOG, "error loading records for {} {}", username, e);
            return Ok(resp!(status => 500, message => "Cannot get user records"));
        }
    };
    records.sort_by(|a, b| b.date_timestamp.cmp(&a.date_timestamp));
    let records: Vec<RecordRest> = records.iter().map(|r| r.to_rest()).collect();
    Ok(resp!(json => records))
}

async fn user_status(req: tide::Request<Context>) -> tide::Result {
    let username = req.param("username")?;
    let store = &req.state().store;
    let status = store.get_watermark(username).and_then(|scan| {
        let total = store.get_records(username)?.len();
        Ok(UserStatus::new(&scan, total))
    });
    match status {
        Ok(status) => Ok(resp!(json => status)),
        Err(e) => {
            slog::error!(LOG, "error loading status for {} {}", username, e);
            Ok(resp!(status => 500, message => "Cannot get user status"))
        }
    }
}
