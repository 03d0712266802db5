use chrono::Utc;
use mongodb::Client;
use rocket::{serde::json::Json, Route, State};

use crate::{
    error::Result,
    model::{
        api::{
            auth::AdminAuth,
            token::{GenerateTokens, GeneratedTokens, TokenDescription, TokenSheet},
        },
        db::{election::Election, session::VoterSession, token::Token},
        mongodb::{Coll, Id},
    },
};

pub fn routes() -> Vec<Route> {
    routes![generate_tokens, invalidate_token, token_sheet]
}

#[post("/admin/tokens/generate/<election_id>", data = "<request>", format = "json")]
async fn generate_tokens(
    _auth: AdminAuth,
    election_id: Id,
    request: Json<GenerateTokens>,
    elections: Coll<Election>,
    tokens: Coll<Token>,
    db_client: &State<Client>,
) -> Result<Json<GeneratedTokens>> {
    let GenerateTokens { count, batch_label } = request.0;
    let created = Token::generate(
        db_client,
        &elections,
        &tokens,
        election_id,
        count,
        batch_label,
        Utc::now(),
    )
    .await?;
    Ok(Json(GeneratedTokens { created }))
}

#[post("/admin/tokens/invalidate/<token_id>")]
async fn invalidate_token(
    _auth: AdminAuth,
    token_id: Id,
    tokens: Coll<Token>,
    elections: Coll<Election>,
    sessions: Coll<VoterSession>,
    db_client: &State<Client>,
) -> Result<Json<TokenDescription>> {
    let token =
        Token::invalidate(db_client, &tokens, &elections, &sessions, token_id, Utc::now()).await?;
    Ok(Json(token.into()))
}

#[get("/admin/elections/<election_id>/tokens")]
async fn token_sheet(
    _auth: AdminAuth,
    election_id: Id,
    elections: Coll<Election>,
    tokens: Coll<Token>,
) -> Result<Json<TokenSheet>> {
    Election::find(&elections, election_id).await?;
    let tokens = Token::for_election(&tokens, election_id).await?;
    Ok(Json(tokens.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::{json, Value},
    };

    use super::*;
    use crate::model::{
        api::election::{ElectionDescription, ElectionSpec},
        common::token::{is_redacted, TokenStatus},
    };

    async fn draft(client: &Client) -> Id {
        let response = client
            .post("/admin/elections")
            .header(ContentType::JSON)
            .body(json!(ElectionSpec::example_future("osis-2024")).to_string())
            .dispatch()
            .await;
        let election: ElectionDescription = response.into_json().await.unwrap();
        *election.id
    }

    async fn generate(client: &Client, election_id: Id, body: Value) -> (Status, Value) {
        let response = client
            .post(uri!(generate_tokens(election_id)))
            .header(ContentType::JSON)
            .body(body.to_string())
            .dispatch()
            .await;
        let status = response.status();
        (status, response.into_json().await.unwrap())
    }

    #[backend_test(admin)]
    async fn generate_validates_requests(client: Client) {
        let id = draft(&client).await;

        for count in [0, 5001] {
            let (status, body) = generate(&client, id, json!({ "count": count })).await;
            assert_eq!(status, Status::BadRequest);
            assert_eq!(body["code"], "BAD_REQUEST");
        }
        let (status, body) = generate(&client, Id::new(), json!({ "count": 1 })).await;
        assert_eq!(status, Status::NotFound);
        assert_eq!(body["code"], "NOT_FOUND");

        let (status, body) = generate(&client, id, json!({ "count": 25 })).await;
        assert_eq!(status, Status::Ok);
        assert_eq!(body["created"], 25);

        let response = client.get(uri!(token_sheet(id))).dispatch().await;
        let sheet: TokenSheet = response.into_json().await.unwrap();
        assert_eq!(sheet.counts.unused, 25);
        assert_eq!(sheet.tokens.len(), 25);
    }

    #[backend_test(admin)]
    async fn invalidate_over_http(client: Client, tokens: Coll<Token>) {
        let id = draft(&client).await;
        let (status, _) = generate(&client, id, json!({ "count": 2 })).await;
        assert_eq!(status, Status::Ok);
        let token = Token::for_election(&tokens, id).await.unwrap().remove(0);

        let response = client.post(uri!(invalidate_token(token.id))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let described: TokenDescription = response.into_json().await.unwrap();
        assert_eq!(described.status, TokenStatus::Invalidated);
        assert_eq!(described.token, None);
        assert!(described.invalidated_at.is_some());

        let stored = tokens.find_one(token.id.as_doc(), None).await.unwrap().unwrap();
        assert!(is_redacted(&stored.token));

        // Idempotent.
        let response = client.post(uri!(invalidate_token(token.id))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);

        let response = client.post(uri!(invalidate_token(Id::new()))).dispatch().await;
        assert_eq!(response.status(), Status::NotFound);

        let response = client.get(uri!(token_sheet(id))).dispatch().await;
        let sheet: TokenSheet = response.into_json().await.unwrap();
        assert_eq!((sheet.counts.unused, sheet.counts.invalidated), (1, 1));
    }
}
