use chrono::Utc;
use mongodb::{bson::doc, Client};
use rocket::{http::CookieJar, serde::json::Json, Route, State};

use crate::{
    error::{Error, Result},
    model::{
        api::{
            admin::AdminCredentials,
            auth::{SessionDescription, SessionKind},
            token::TokenLoginRequest,
        },
        db::{
            admin::Admin,
            election::Election,
            session::{AdminSession, VoterSession},
            token::Token,
        },
        mongodb::Coll,
    },
    rate_limit::{AdminLogin, RateLimited, TokenLogin},
    Config,
};

pub fn routes() -> Vec<Route> {
    routes![token_login, voter_logout, admin_login, admin_logout]
}

#[post("/auth/token-login", data = "<request>", format = "json")]
#[allow(clippy::too_many_arguments)]
pub async fn token_login(
    gate: std::result::Result<RateLimited<TokenLogin>, Error>,
    request: Json<TokenLoginRequest>,
    cookies: &CookieJar<'_>,
    tokens: Coll<Token>,
    elections: Coll<Election>,
    sessions: Coll<VoterSession>,
    db_client: &State<Client>,
    config: &State<Config>,
) -> Result<Json<SessionDescription>> {
    gate?;
    let (secret, session) = VoterSession::login(
        db_client,
        &tokens,
        &elections,
        &sessions,
        &request.token,
        Utc::now(),
        config.voter_session_ttl(),
    )
    .await?;

    cookies.add(SessionKind::Voter.cookie(&secret, config));
    Ok(Json((&session).into()))
}

/// Always succeeds, whether or not there was a session.
#[post("/auth/logout")]
pub async fn voter_logout(cookies: &CookieJar<'_>, sessions: Coll<VoterSession>) -> Result<()> {
    if let Some(secret) = SessionKind::Voter.secret(cookies) {
        VoterSession::logout(&sessions, &secret).await?;
    }
    SessionKind::Voter.clear(cookies);
    Ok(())
}

#[post("/auth/admin", data = "<credentials>", format = "json")]
pub async fn admin_login(
    gate: std::result::Result<RateLimited<AdminLogin>, Error>,
    credentials: Json<AdminCredentials>,
    cookies: &CookieJar<'_>,
    admins: Coll<Admin>,
    sessions: Coll<AdminSession>,
    config: &State<Config>,
) -> Result<Json<SessionDescription>> {
    gate?;
    let with_username = doc! {
        "username": &credentials.username
    };

    let admin = admins
        .find_one(with_username, None)
        .await?
        .filter(|admin| admin.verify_password(&credentials.password))
        .ok_or_else(|| {
            Error::Unauthorized(
                "No admin found with the provided username and password combination".to_string(),
            )
        })?;

    let (secret, session) =
        AdminSession::create(&sessions, admin.id, Utc::now(), config.admin_session_ttl()).await?;
    info!("Admin {} logged in", admin.username);

    cookies.add(SessionKind::Admin.cookie(&secret, config));
    Ok(Json((&session).into()))
}

#[delete("/auth/admin")]
pub async fn admin_logout(cookies: &CookieJar<'_>, sessions: Coll<AdminSession>) -> Result<()> {
    if let Some(secret) = SessionKind::Admin.secret(cookies) {
        AdminSession::logout(&sessions, &secret).await?;
    }
    SessionKind::Admin.clear(cookies);
    Ok(())
}

#[cfg(test)]
mod tests {
    use mongodb::{Client as MongoClient, Database};
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::{json, Value},
    };

    use super::*;
    use crate::model::{
        api::{
            auth::{ADMIN_SESSION_COOKIE, VOTER_SESSION_COOKIE},
            election::ElectionSpec,
        },
        common::{election::Transition, token::TokenString},
        mongodb::Guard,
    };

    #[backend_test(admin)]
    async fn admin_login_and_logout(client: Client, sessions: Coll<AdminSession>) {
        // Logged in by the test harness.
        assert!(client.cookies().get(ADMIN_SESSION_COOKIE).is_some());
        assert_eq!(sessions.count_documents(None, None).await.unwrap(), 1);

        let response = client.get("/admin/elections").dispatch().await;
        assert_eq!(response.status(), Status::Ok);

        let response = client.delete(uri!(admin_logout)).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert!(client.cookies().get(ADMIN_SESSION_COOKIE).is_none());
        assert_eq!(sessions.count_documents(None, None).await.unwrap(), 0);

        let response = client.get("/admin/elections").dispatch().await;
        assert_eq!(response.status(), Status::Unauthorized);
    }

    #[backend_test(admin)]
    async fn wrong_password_is_unauthorized(client: Client) {
        let credentials = AdminCredentials {
            password: "definitely-wrong".to_string(),
            ..AdminCredentials::example()
        };
        let response = client
            .post(uri!(admin_login))
            .header(ContentType::JSON)
            .body(json!(credentials).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    async fn login(client: &Client, token: &str) -> (Status, Value) {
        let response = client
            .post(uri!(token_login))
            .header(ContentType::JSON)
            .body(json!({ "token": token }).to_string())
            .dispatch()
            .await;
        let status = response.status();
        (status, response.into_json().await.unwrap())
    }

    #[backend_test]
    async fn token_login_outcomes(
        client: Client,
        db_client: MongoClient,
        db: Database,
        tokens: Coll<Token>,
        elections: Coll<Election>,
        guards: Coll<Guard>,
        sessions: Coll<VoterSession>,
    ) {
        let now = Utc::now();
        let spec = ElectionSpec::example_open("osis-2024").into_new(now).unwrap();
        let election = Election::create(&Coll::from_db(&db), spec).await.unwrap();
        let token = Token::new(election.id, TokenString::parse("ABCD-EFGH").unwrap(), None, now);
        tokens.insert_one(&token, None).await.unwrap();

        // Not open yet.
        let (status, body) = login(&client, "ABCD-EFGH").await;
        assert_eq!(status, Status::Conflict);
        assert_eq!(body["code"], "ELECTION_INACTIVE");

        Election::transition(&db_client, &elections, &guards, election.id, Transition::Activate, now)
            .await
            .unwrap();

        let (status, body) = login(&client, "nope").await;
        assert_eq!(status, Status::BadRequest);
        assert_eq!(body["code"], "TOKEN_INVALID");
        let (status, body) = login(&client, "ZZZZ-ZZZZ").await;
        assert_eq!(status, Status::BadRequest);
        assert_eq!(body["code"], "TOKEN_INVALID");

        // Lower case and no dash still work.
        let (status, body) = login(&client, "abcdefgh").await;
        assert_eq!(status, Status::Ok);
        assert_eq!(body["electionId"], election.id.to_string());
        assert!(client.cookies().get(VOTER_SESSION_COOKIE).is_some());
        assert_eq!(sessions.count_documents(None, None).await.unwrap(), 1);

        let response = client.post(uri!(voter_logout)).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert!(client.cookies().get(VOTER_SESSION_COOKIE).is_none());
        assert_eq!(sessions.count_documents(None, None).await.unwrap(), 0);

        // Logging out twice is fine.
        let response = client.post(uri!(voter_logout)).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
    }

    #[backend_test]
    async fn token_login_is_rate_limited(client: Client) {
        let config = client.rocket().state::<Config>().unwrap();
        let (_, max) = config.token_login_limit();

        for _ in 0..max {
            let response = client
                .post(uri!(token_login))
                .header(ContentType::JSON)
                .body(json!({ "token": "ZZZZ-ZZZZ" }).to_string())
                .dispatch()
                .await;
            assert_eq!(response.status(), Status::BadRequest);
            assert!(response.headers().get_one("X-RateLimit-Remaining").is_some());
        }

        let response = client
            .post(uri!(token_login))
            .header(ContentType::JSON)
            .body(json!({ "token": "ZZZZ-ZZZZ" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::TooManyRequests);
        assert_eq!(response.headers().get_one("X-RateLimit-Remaining"), Some("0"));
        assert_eq!(
            response.headers().get_one("X-RateLimit-Limit"),
            Some(max.to_string().as_str())
        );
        assert!(response.headers().get_one("Retry-After").is_some());
        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body["code"], "RATE_LIMITED");
    }
}
