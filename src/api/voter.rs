use chrono::Utc;
use mongodb::{Client, Database};
use rocket::{http::CookieJar, serde::json::Json, Route, State};

use crate::{
    error::{Error, Result},
    model::{
        api::{
            auth::{SessionKind, VoterAuth},
            election::CandidateDescription,
            vote::{BallotView, ReceiptDescription, VoteRequest},
        },
        db::{
            candidate::CandidatePair,
            election::Election,
            vote::{Vote, VoteError},
        },
        mongodb::Coll,
    },
    rate_limit::{CastVote, RateLimited},
};

pub fn routes() -> Vec<Route> {
    routes![ballot, cast_vote]
}

#[get("/voter/ballot")]
async fn ballot(
    auth: VoterAuth,
    elections: Coll<Election>,
    candidates: Coll<CandidatePair>,
) -> Result<Json<BallotView>> {
    let election = Election::find(&elections, auth.session.election_id).await?;
    if !election.is_open(Utc::now()) {
        return Err(VoteError::ElectionInactive.into());
    }
    let candidates = CandidatePair::for_election(&candidates, election.id, true)
        .await?
        .into_iter()
        .map(CandidateDescription::from)
        .collect();
    Ok(Json(BallotView {
        election: election.into(),
        candidates,
    }))
}

#[post("/vote", data = "<vote>", format = "json")]
async fn cast_vote(
    gate: std::result::Result<RateLimited<CastVote>, Error>,
    vote: Json<VoteRequest>,
    cookies: &CookieJar<'_>,
    db_client: &State<Client>,
    db: &State<Database>,
) -> Result<Json<ReceiptDescription>> {
    gate?;
    let secret = SessionKind::Voter
        .secret(cookies)
        .ok_or(VoteError::Unauthorized)?;

    let receipt = Vote::cast(db_client, db, &secret, *vote.candidate_pair_id, Utc::now()).await?;

    // The session is gone; so should the cookie be.
    SessionKind::Voter.clear(cookies);
    Ok(Json(receipt.into()))
}

#[cfg(test)]
mod tests {
    use mongodb::Client as MongoClient;
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::{json, Value},
    };

    use super::*;
    use crate::model::{
        api::{
            election::{CandidateSpec, ElectionSpec},
            id::ApiId,
        },
        common::{
            election::Transition,
            token::{is_redacted, TokenStatus, TokenString},
        },
        db::{candidate::NewCandidatePair, token::Token},
        mongodb::{Guard, Id},
    };

    /// An active election with two candidates and one unused token.
    async fn open_election(db_client: &MongoClient, db: &Database) -> (Election, Vec<CandidatePair>, Token) {
        let now = Utc::now();
        let spec = ElectionSpec::example_open("osis-2024").into_new(now).unwrap();
        let election = Election::create(&Coll::from_db(db), spec).await.unwrap();
        let mut candidates = Vec::new();
        for number in 1..=2 {
            let candidate = CandidatePair::create(
                db_client,
                &Coll::from_db(db),
                &Coll::<NewCandidatePair>::from_db(db),
                CandidateSpec::example(number).into_new(election.id, now),
            )
            .await
            .unwrap();
            candidates.push(candidate);
        }
        let token = Token::new(election.id, TokenString::parse("ABCD-EFGH").unwrap(), None, now);
        Coll::<Token>::from_db(db).insert_one(&token, None).await.unwrap();
        let election = Election::transition(
            db_client,
            &Coll::from_db(db),
            &Coll::<Guard>::from_db(db),
            election.id,
            Transition::Activate,
            now,
        )
        .await
        .unwrap();
        (election, candidates, token)
    }

    async fn login(client: &Client, token: &str) -> Status {
        client
            .post("/auth/token-login")
            .header(ContentType::JSON)
            .body(json!({ "token": token }).to_string())
            .dispatch()
            .await
            .status()
    }

    async fn vote(client: &Client, candidate: Id) -> (Status, Value) {
        let response = client
            .post(uri!(cast_vote))
            .header(ContentType::JSON)
            .body(json!({ "candidatePairId": ApiId::from(candidate) }).to_string())
            .dispatch()
            .await;
        let status = response.status();
        (status, response.into_json().await.unwrap())
    }

    #[backend_test]
    async fn ballot_then_vote(client: Client, db_client: MongoClient, db: Database, tokens: Coll<Token>) {
        let (election, candidates, token) = open_election(&db_client, &db).await;

        // Nothing without a session.
        let response = client.get(uri!(ballot)).dispatch().await;
        assert_eq!(response.status(), Status::Unauthorized);
        let (status, body) = vote(&client, candidates[0].id).await;
        assert_eq!(status, Status::Unauthorized);
        assert_eq!(body["code"], "UNAUTHORIZED");

        assert_eq!(login(&client, "ABCD-EFGH").await, Status::Ok);
        let response = client.get(uri!(ballot)).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let view: BallotView = response.into_json().await.unwrap();
        assert_eq!(view.election.id, ApiId::from(election.id));
        let numbers: Vec<u32> = view.candidates.iter().map(|c| c.number).collect();
        assert_eq!(numbers, vec![1, 2]);

        // A candidate from nowhere is refused and the token survives.
        let (status, body) = vote(&client, Id::new()).await;
        assert_eq!(status, Status::BadRequest);
        assert_eq!(body["code"], "CANDIDATE_INVALID");

        let (status, body) = vote(&client, candidates[1].id).await;
        assert_eq!(status, Status::Ok);
        assert_eq!(body["electionId"], election.id.to_string());
        assert!(body.get("candidatePairId").is_none());

        let stored = tokens.find_one(token.id.as_doc(), None).await.unwrap().unwrap();
        assert_eq!(stored.status, TokenStatus::Used);
        assert!(is_redacted(&stored.token));

        // The session went with the vote.
        let (status, _) = vote(&client, candidates[0].id).await;
        assert_eq!(status, Status::Unauthorized);
        let response = client.get(uri!(ballot)).dispatch().await;
        assert_eq!(response.status(), Status::Unauthorized);
    }
}
