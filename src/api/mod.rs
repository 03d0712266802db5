use rocket::{http::Status, serde::json::Json, Catcher, Request, Route};

use crate::error::ErrorBody;

mod admin;
pub(crate) mod auth;
mod public;
mod tokens;
mod voter;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(admin::routes());
    routes.extend(public::routes());
    routes.extend(auth::routes());
    routes.extend(tokens::routes());
    routes.extend(voter::routes());
    routes
}

/// Render framework-level failures with the same body as handler errors.
pub fn catchers() -> Vec<Catcher> {
    catchers![
        bad_request,
        unauthorized,
        not_found,
        unprocessable,
        rate_limited,
        internal,
        fallback
    ]
}

#[catch(400)]
fn bad_request() -> Json<ErrorBody> {
    Json(ErrorBody::new("BAD_REQUEST", "The request could not be understood"))
}

#[catch(401)]
fn unauthorized() -> Json<ErrorBody> {
    Json(ErrorBody::new("UNAUTHORIZED", "Not logged in, or the session has expired"))
}

#[catch(404)]
fn not_found(req: &Request) -> Json<ErrorBody> {
    Json(ErrorBody::new("NOT_FOUND", format!("Nothing at {}", req.uri().path())))
}

#[catch(422)]
fn unprocessable() -> Json<ErrorBody> {
    Json(ErrorBody::new("BAD_REQUEST", "The request body or parameters are invalid"))
}

#[catch(429)]
fn rate_limited() -> Json<ErrorBody> {
    Json(ErrorBody::new("RATE_LIMITED", "Rate limit exceeded"))
}

#[catch(500)]
fn internal() -> Json<ErrorBody> {
    Json(ErrorBody::new("INTERNAL_ERROR", "An internal error occurred"))
}

#[catch(default)]
fn fallback(status: Status, _req: &Request) -> Json<ErrorBody> {
    let code = if status.code >= 500 {
        "INTERNAL_ERROR"
    } else {
        "BAD_REQUEST"
    };
    Json(ErrorBody::new(code, status.reason_lossy()))
}

#[cfg(test)]
mod tests {
    use mongodb::Database;
    use rocket::local::asynchronous::Client;

    use super::*;

    #[backend_test]
    async fn unknown_routes_get_json_errors(client: Client, _db: Database) {
        let response = client.get("/no/such/route").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
        let body: rocket::serde::json::Value = response.into_json().await.unwrap();
        assert_eq!(body["code"], "NOT_FOUND");
    }
}
