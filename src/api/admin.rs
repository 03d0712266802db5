use chrono::Utc;
use mongodb::{Client, Database};
use rocket::{serde::json::Json, Route, State};

use crate::{
    error::Result,
    model::{
        api::{
            auth::AdminAuth,
            election::{
                CandidateDescription, CandidateSpec, ElectionDescription, ElectionResults,
                ElectionSpec, ElectionUpdate, ResultsVisibility,
            },
        },
        common::election::Transition,
        db::{
            candidate::{CandidatePair, NewCandidatePair},
            election::{Election, NewElection},
            sweeper::{sweep, SweepReport},
            vote::Vote,
        },
        mongodb::{Coll, Guard, Id},
    },
    Config,
};

pub fn routes() -> Vec<Route> {
    routes![
        list_elections,
        create_election,
        update_election,
        activate_election,
        close_election,
        archive_election,
        set_results_public,
        list_candidates,
        create_candidate,
        election_results,
        run_sweep,
    ]
}

#[get("/admin/elections")]
async fn list_elections(
    _auth: AdminAuth,
    elections: Coll<Election>,
) -> Result<Json<Vec<ElectionDescription>>> {
    let elections = Election::list(&elections).await?;
    Ok(Json(elections.into_iter().map(Into::into).collect()))
}

#[post("/admin/elections", data = "<spec>", format = "json")]
async fn create_election(
    _auth: AdminAuth,
    spec: Json<ElectionSpec>,
    new_elections: Coll<NewElection>,
) -> Result<Json<ElectionDescription>> {
    let election = spec.0.into_new(Utc::now())?;
    let election = Election::create(&new_elections, election).await?;
    Ok(Json(election.into()))
}

#[patch("/admin/elections/<election_id>", data = "<update>", format = "json")]
async fn update_election(
    _auth: AdminAuth,
    election_id: Id,
    update: Json<ElectionUpdate>,
    elections: Coll<Election>,
) -> Result<Json<ElectionDescription>> {
    let election = Election::update(&elections, election_id, &update).await?;
    Ok(Json(election.into()))
}

async fn transition(
    election_id: Id,
    transition: Transition,
    elections: Coll<Election>,
    guards: Coll<Guard>,
    db_client: &Client,
) -> Result<Json<ElectionDescription>> {
    let election =
        Election::transition(db_client, &elections, &guards, election_id, transition, Utc::now())
            .await?;
    Ok(Json(election.into()))
}

#[post("/admin/elections/<election_id>/activate")]
async fn activate_election(
    _auth: AdminAuth,
    election_id: Id,
    elections: Coll<Election>,
    guards: Coll<Guard>,
    db_client: &State<Client>,
) -> Result<Json<ElectionDescription>> {
    transition(election_id, Transition::Activate, elections, guards, db_client).await
}

#[post("/admin/elections/<election_id>/close")]
async fn close_election(
    _auth: AdminAuth,
    election_id: Id,
    elections: Coll<Election>,
    guards: Coll<Guard>,
    db_client: &State<Client>,
) -> Result<Json<ElectionDescription>> {
    transition(election_id, Transition::Close, elections, guards, db_client).await
}

#[post("/admin/elections/<election_id>/archive")]
async fn archive_election(
    _auth: AdminAuth,
    election_id: Id,
    elections: Coll<Election>,
    guards: Coll<Guard>,
    db_client: &State<Client>,
) -> Result<Json<ElectionDescription>> {
    transition(election_id, Transition::Archive, elections, guards, db_client).await
}

#[post("/admin/elections/<election_id>/results-public", data = "<visibility>", format = "json")]
async fn set_results_public(
    _auth: AdminAuth,
    election_id: Id,
    visibility: Json<ResultsVisibility>,
    elections: Coll<Election>,
) -> Result<Json<ElectionDescription>> {
    let election =
        Election::set_results_public(&elections, election_id, visibility.is_result_public).await?;
    Ok(Json(election.into()))
}

#[get("/admin/elections/<election_id>/candidates")]
async fn list_candidates(
    _auth: AdminAuth,
    election_id: Id,
    elections: Coll<Election>,
    candidates: Coll<CandidatePair>,
) -> Result<Json<Vec<CandidateDescription>>> {
    Election::find(&elections, election_id).await?;
    let candidates = CandidatePair::for_election(&candidates, election_id, false).await?;
    Ok(Json(candidates.into_iter().map(Into::into).collect()))
}

#[post("/admin/elections/<election_id>/candidates", data = "<spec>", format = "json")]
async fn create_candidate(
    _auth: AdminAuth,
    election_id: Id,
    spec: Json<CandidateSpec>,
    elections: Coll<Election>,
    new_candidates: Coll<NewCandidatePair>,
    db_client: &State<Client>,
) -> Result<Json<CandidateDescription>> {
    let candidate = spec.0.into_new(election_id, Utc::now());
    let candidate = CandidatePair::create(db_client, &elections, &new_candidates, candidate).await?;
    Ok(Json(candidate.into()))
}

#[get("/admin/elections/<election_id>/results")]
async fn election_results(
    _auth: AdminAuth,
    election_id: Id,
    elections: Coll<Election>,
    candidates: Coll<CandidatePair>,
    votes: Coll<Vote>,
) -> Result<Json<ElectionResults>> {
    let election = Election::find(&elections, election_id).await?;
    let tally = Vote::tally(&votes, &candidates, election_id).await?;
    Ok(Json(ElectionResults::new(election, tally)))
}

#[post("/admin/maintenance/sweep")]
async fn run_sweep(
    _auth: AdminAuth,
    db: &State<Database>,
    config: &State<Config>,
) -> Result<Json<SweepReport>> {
    let report = sweep(db, Utc::now(), config.sweep_batch_size()).await?;
    info!("Manual sweep finished ({report})");
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::{Client, LocalResponse},
        serde::json::{json, Value},
    };

    use super::*;
    use crate::model::{
        api::{
            id::ApiId,
            token::{GeneratedTokens, TokenSheet},
        },
        common::{
            election::ElectionStatus,
            token::{is_redacted, TokenStatus},
        },
        db::token::Token,
    };

    async fn post_json<'c>(client: &'c Client, uri: String, body: Value) -> LocalResponse<'c> {
        client
            .post(uri)
            .header(ContentType::JSON)
            .body(body.to_string())
            .dispatch()
            .await
    }

    async fn create(client: &Client, spec: &ElectionSpec) -> ElectionDescription {
        let response = post_json(client, uri!(create_election).to_string(), json!(spec)).await;
        assert_eq!(response.status(), Status::Ok);
        response.into_json().await.unwrap()
    }

    async fn error_code(response: LocalResponse<'_>) -> (Status, String) {
        let status = response.status();
        let body: Value = response.into_json().await.unwrap();
        (status, body["code"].as_str().unwrap_or_default().to_string())
    }

    #[backend_test]
    async fn admin_routes_need_a_session(client: Client) {
        let spec = ElectionSpec::example_open("osis-2024");
        let response = post_json(&client, uri!(create_election).to_string(), json!(spec)).await;
        assert_eq!(error_code(response).await, (Status::Unauthorized, "UNAUTHORIZED".to_string()));
        let response = client.post(uri!(run_sweep)).dispatch().await;
        assert_eq!(response.status(), Status::Unauthorized);
    }

    #[backend_test(admin)]
    async fn create_and_update_election(client: Client) {
        let election = create(&client, &ElectionSpec::example_future("osis-2024")).await;
        assert_eq!(election.status, ElectionStatus::Draft);
        assert!(!election.is_result_public);

        // Slugs are unique.
        let response = post_json(
            &client,
            uri!(create_election).to_string(),
            json!(ElectionSpec::example_future("osis-2024")),
        )
        .await;
        assert_eq!(error_code(response).await, (Status::Conflict, "SLUG_TAKEN".to_string()));

        // The schedule must end after it starts.
        let mut backwards = ElectionSpec::example_future("osis-2025");
        backwards.end_time = backwards.start_time - Duration::minutes(1);
        let response = post_json(&client, uri!(create_election).to_string(), json!(backwards)).await;
        assert_eq!(error_code(response).await, (Status::BadRequest, "SCHEDULE_INVALID".to_string()));

        let id = *election.id;
        let response = client
            .patch(uri!(update_election(id)))
            .header(ContentType::JSON)
            .body(json!({ "name": "Pemilihan Ketua OSIS 2024" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let updated: ElectionDescription = response.into_json().await.unwrap();
        assert_eq!(updated.name, "Pemilihan Ketua OSIS 2024");
        assert_eq!(updated.slug, "osis-2024");

        let response = client
            .patch(uri!(update_election(id)))
            .header(ContentType::JSON)
            .body(json!({ "endTime": election.start_time - Duration::hours(1) }).to_string())
            .dispatch()
            .await;
        assert_eq!(error_code(response).await, (Status::BadRequest, "SCHEDULE_INVALID".to_string()));

        let response = client.get(uri!(list_elections)).dispatch().await;
        let listed: Vec<ElectionDescription> = response.into_json().await.unwrap();
        assert_eq!(listed, vec![updated]);

        let response = client
            .patch(uri!(update_election(Id::new())))
            .header(ContentType::JSON)
            .body("{}")
            .dispatch()
            .await;
        assert_eq!(error_code(response).await, (Status::NotFound, "NOT_FOUND".to_string()));
    }

    #[backend_test(admin)]
    async fn lifecycle_over_http(client: Client) {
        let future = create(&client, &ElectionSpec::example_future("later")).await;
        let response = client.post(uri!(activate_election(*future.id))).dispatch().await;
        assert_eq!(error_code(response).await, (Status::Conflict, "OUTSIDE_SCHEDULE".to_string()));

        let open = create(&client, &ElectionSpec::example_open("now")).await;
        let id = *open.id;
        let response = client.post(uri!(close_election(id))).dispatch().await;
        assert_eq!(error_code(response).await, (Status::Conflict, "INVALID_TRANSITION".to_string()));

        let response = client.post(uri!(activate_election(id))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let active: ElectionDescription = response.into_json().await.unwrap();
        assert_eq!(active.status, ElectionStatus::Active);

        // Results can only be published once closed.
        let response = post_json(
            &client,
            uri!(set_results_public(id)).to_string(),
            json!({ "isResultPublic": true }),
        )
        .await;
        assert_eq!(error_code(response).await, (Status::Conflict, "ELECTION_NOT_CLOSED".to_string()));

        let response = client.post(uri!(close_election(id))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let response = post_json(
            &client,
            uri!(set_results_public(id)).to_string(),
            json!({ "isResultPublic": true }),
        )
        .await;
        assert_eq!(response.status(), Status::Ok);
        let published: ElectionDescription = response.into_json().await.unwrap();
        assert!(published.is_result_public);

        let response = client.post(uri!(archive_election(id))).dispatch().await;
        let archived: ElectionDescription = response.into_json().await.unwrap();
        assert_eq!(archived.status, ElectionStatus::Archived);
    }

    /// Generate tokens, activate, log in with one, vote, and check the token
    /// can never be used again.
    #[backend_test(admin)]
    async fn full_voting_scenario(client: Client, tokens: Coll<Token>) {
        let election = create(&client, &ElectionSpec::example_open("osis-2024")).await;
        let id = *election.id;

        let mut candidates = Vec::new();
        for number in 1..=2 {
            let response = post_json(
                &client,
                uri!(create_candidate(id)).to_string(),
                json!(CandidateSpec::example(number)),
            )
            .await;
            assert_eq!(response.status(), Status::Ok);
            let candidate: CandidateDescription = response.into_json().await.unwrap();
            candidates.push(candidate);
        }

        let response = post_json(
            &client,
            format!("/admin/tokens/generate/{id}"),
            json!({ "count": 10, "batchLabel": "A" }),
        )
        .await;
        assert_eq!(response.status(), Status::Ok);
        let generated: GeneratedTokens = response.into_json().await.unwrap();
        assert_eq!(generated.created, 10);

        let response = client.post(uri!(activate_election(id))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);

        // No more tokens or candidates once active.
        let response = post_json(
            &client,
            format!("/admin/tokens/generate/{id}"),
            json!({ "count": 1 }),
        )
        .await;
        assert_eq!(error_code(response).await, (Status::BadRequest, "BAD_REQUEST".to_string()));
        let response = post_json(
            &client,
            uri!(create_candidate(id)).to_string(),
            json!(CandidateSpec::example(3)),
        )
        .await;
        assert_eq!(error_code(response).await, (Status::Conflict, "ELECTION_NOT_DRAFT".to_string()));

        let response = client.get(format!("/admin/elections/{id}/tokens")).dispatch().await;
        let sheet: TokenSheet = response.into_json().await.unwrap();
        assert_eq!(sheet.counts.unused, 10);
        assert!(sheet
            .tokens
            .iter()
            .all(|t| t.generated_batch.as_deref() == Some("A")));
        let raw = sheet.tokens[0].token.clone().unwrap();
        let token_id = sheet.tokens[0].id;

        // Vote.
        let response = post_json(&client, "/auth/token-login".to_string(), json!({ "token": raw })).await;
        assert_eq!(response.status(), Status::Ok);
        let response = post_json(
            &client,
            "/vote".to_string(),
            json!({ "candidatePairId": candidates[0].id }),
        )
        .await;
        assert_eq!(response.status(), Status::Ok);

        let stored = tokens.find_one(token_id.as_doc(), None).await.unwrap().unwrap();
        assert_eq!(stored.status, TokenStatus::Used);
        assert!(stored.used_at.is_some());
        assert!(is_redacted(&stored.token));

        // The raw string no longer exists anywhere.
        let response = post_json(&client, "/auth/token-login".to_string(), json!({ "token": raw })).await;
        assert_eq!(error_code(response).await, (Status::BadRequest, "TOKEN_INVALID".to_string()));

        let response = client.get(uri!(election_results(id))).dispatch().await;
        let results: ElectionResults = response.into_json().await.unwrap();
        assert_eq!(results.total_votes, 1);
        let counts: Vec<(ApiId, u64)> = results
            .candidates
            .iter()
            .map(|c| (c.candidate.id, c.votes))
            .collect();
        assert_eq!(counts, vec![(candidates[0].id, 1), (candidates[1].id, 0)]);

        let response = client.post(uri!(run_sweep)).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let report: SweepReport = response.into_json().await.unwrap();
        assert_eq!(report.redacted_tokens, 0);
    }
}
