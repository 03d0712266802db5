use rocket::{serde::json::Json, Route};

use crate::{
    error::{Error, Result},
    model::{
        api::election::{ElectionDescription, ElectionResults},
        db::{candidate::CandidatePair, election::Election, vote::Vote},
        mongodb::Coll,
    },
};

pub fn routes() -> Vec<Route> {
    routes![active_election, public_results]
}

#[get("/elections/active")]
async fn active_election(elections: Coll<Election>) -> Result<Json<ElectionDescription>> {
    Election::active(&elections)
        .await?
        .map(|election| Json(election.into()))
        .ok_or_else(|| Error::not_found("Active election"))
}

/// Results of an election, once published by an admin. Unpublished results
/// are indistinguishable from a missing election.
#[get("/elections/<slug>/results")]
async fn public_results(
    slug: &str,
    elections: Coll<Election>,
    candidates: Coll<CandidatePair>,
    votes: Coll<Vote>,
) -> Result<Json<ElectionResults>> {
    let election = Election::find_by_slug(&elections, slug)
        .await?
        .filter(|election| election.is_result_public)
        .ok_or_else(|| Error::not_found(format!("Results for {slug}")))?;
    let tally = Vote::tally(&votes, &candidates, election.id).await?;
    Ok(Json(ElectionResults::new(election, tally)))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use mongodb::{Client as MongoClient, Database};
    use rocket::{http::Status, local::asynchronous::Client};

    use super::*;
    use crate::model::{
        api::election::ElectionSpec,
        common::election::Transition,
        mongodb::Guard,
    };

    #[backend_test]
    async fn active_and_published_results(
        client: Client,
        db_client: MongoClient,
        db: Database,
        elections: Coll<Election>,
        guards: Coll<Guard>,
    ) {
        let response = client.get(uri!(active_election)).dispatch().await;
        assert_eq!(response.status(), Status::NotFound);

        let now = Utc::now();
        let spec = ElectionSpec::example_open("osis-2024").into_new(now).unwrap();
        let election = Election::create(&Coll::from_db(&db), spec).await.unwrap();
        Election::transition(&db_client, &elections, &guards, election.id, Transition::Activate, now)
            .await
            .unwrap();

        let response = client.get(uri!(active_election)).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let active: ElectionDescription = response.into_json().await.unwrap();
        assert_eq!(active.slug, "osis-2024");

        // Hidden until closed and published.
        let response = client.get(uri!(public_results("osis-2024"))).dispatch().await;
        assert_eq!(response.status(), Status::NotFound);

        Election::transition(&db_client, &elections, &guards, election.id, Transition::Close, now)
            .await
            .unwrap();
        Election::set_results_public(&elections, election.id, true)
            .await
            .unwrap();

        let response = client.get(uri!(public_results("osis-2024"))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let results: ElectionResults = response.into_json().await.unwrap();
        assert_eq!(results.total_votes, 0);
        assert!(results.election.is_result_public);

        let response = client.get(uri!(active_election)).dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
    }
}
