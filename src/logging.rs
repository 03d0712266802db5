//! Request logging.
//!
//! Every request is logged once, when its response is sent, tagged with a
//! request id that is also returned to the client in `X-Request-Id`. Query
//! strings are never logged.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::Level;
use rocket::{
    fairing::{Fairing, Info, Kind},
    http::{Header, Status, StatusClass},
    Data, Orbit, Request, Response, Rocket,
};

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Sequence number of a request within this process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// The id of `req`, assigned on first use.
    pub fn of(req: &Request<'_>) -> Self {
        *req.local_cache(Self::next)
    }

    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// The stable error code a request failed with, set by the error responder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureCode(Option<&'static str>);

impl FailureCode {
    pub fn record(req: &Request<'_>, code: &'static str) {
        req.local_cache(|| Self(Some(code)));
    }

    fn of(req: &Request<'_>) -> Option<&'static str> {
        req.local_cache(Self::default).0
    }
}

struct Started(Instant);

/// How loudly to log a finished request.
fn level_for(status: Status, code: Option<&str>) -> Level {
    match status.class() {
        StatusClass::ServerError => Level::Error,
        _ if status == Status::TooManyRequests => Level::Warn,
        // A transaction ran out of retries.
        _ if code == Some("CONFLICT") => Level::Warn,
        _ => Level::Info,
    }
}

#[derive(Debug, Copy, Clone)]
pub struct LoggerFairing;

#[rocket::async_trait]
impl Fairing for LoggerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Logger",
            kind: Kind::Liftoff | Kind::Request | Kind::Response | Kind::Shutdown,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let config = rocket.config();
        info!("Listening on {}:{}", config.address, config.port);
    }

    async fn on_request(&self, req: &mut Request<'_>, _data: &mut Data<'_>) {
        RequestId::of(req);
        req.local_cache(|| Started(Instant::now()));
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        let id = RequestId::of(req);
        res.set_header(Header::new(REQUEST_ID_HEADER, id.0.to_string()));

        let elapsed = req.local_cache(|| Started(Instant::now())).0.elapsed();
        let status = res.status();
        let code = FailureCode::of(req);
        let route = req.route().and_then(|r| r.name.as_deref()).unwrap_or("-");
        log!(
            level_for(status, code),
            "{id} {} {} -> {}{} ({route}, {}ms)",
            req.method(),
            req.uri().path(),
            status.code,
            code.map(|c| format!(" {c}")).unwrap_or_default(),
            elapsed.as_millis()
        );
    }

    async fn on_shutdown(&self, _rocket: &Rocket<Orbit>) {
        info!("Shutting down");
    }
}

#[cfg(test)]
mod tests {
    use rocket::local::asynchronous::Client;

    use super::*;
    use crate::error::{Error, Result};

    #[get("/ok")]
    fn ok() -> &'static str {
        "ok"
    }

    #[get("/busy")]
    fn busy() -> Result<&'static str> {
        Err(Error::Conflict("contended".to_string()))
    }

    #[test]
    fn contention_and_throttling_are_escalated() {
        assert_eq!(level_for(Status::Ok, None), Level::Info);
        assert_eq!(level_for(Status::BadRequest, Some("TOKEN_INVALID")), Level::Info);
        assert_eq!(level_for(Status::Conflict, Some("TOKEN_USED")), Level::Info);
        assert_eq!(level_for(Status::Conflict, Some("CONFLICT")), Level::Warn);
        assert_eq!(level_for(Status::TooManyRequests, Some("RATE_LIMITED")), Level::Warn);
        assert_eq!(level_for(Status::InternalServerError, None), Level::Error);
    }

    #[rocket::async_test]
    async fn responses_carry_distinct_request_ids() {
        let rocket = rocket::build()
            .attach(LoggerFairing)
            .mount("/", routes![ok, busy]);
        let client = Client::tracked(rocket).await.unwrap();

        let first = client.get("/ok").dispatch().await;
        let second = client.get("/busy").dispatch().await;
        assert_eq!(second.status(), Status::Conflict);

        let ids: Vec<u64> = [&first, &second]
            .iter()
            .map(|res| res.headers().get_one(REQUEST_ID_HEADER).unwrap().parse().unwrap())
            .collect();
        assert!(ids[0] < ids[1]);
    }
}
