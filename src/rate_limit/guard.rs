use std::marker::PhantomData;
use std::net::IpAddr;

use rocket::{
    fairing::{Fairing, Info, Kind},
    http::{Header, Status},
    request::{FromRequest, Outcome},
    Request, Response,
};

use crate::error::Error;
use crate::Config;

use super::{Decision, RateLimiter};

/// A named rate-limit policy, with its limits read from the config.
pub trait RatePolicy: Send + Sync + 'static {
    /// Key prefix separating this policy's counters from the others.
    const PREFIX: &'static str;

    /// `(window_seconds, max)` for this policy.
    fn limits(config: &Config) -> (u64, u64);
}

/// Voter token login attempts.
pub struct TokenLogin;

impl RatePolicy for TokenLogin {
    const PREFIX: &'static str = "token-login";

    fn limits(config: &Config) -> (u64, u64) {
        config.token_login_limit()
    }
}

/// Ballot submissions.
pub struct CastVote;

impl RatePolicy for CastVote {
    const PREFIX: &'static str = "vote";

    fn limits(config: &Config) -> (u64, u64) {
        config.vote_limit()
    }
}

/// Admin password login attempts.
pub struct AdminLogin;

impl RatePolicy for AdminLogin {
    const PREFIX: &'static str = "admin-login";

    fn limits(config: &Config) -> (u64, u64) {
        config.admin_login_limit()
    }
}

/// The client a request is attributed to for rate limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Work out the client address. Proxy headers are only consulted when
    /// `trust_proxy` is set, since any client can send them.
    pub fn resolve(req: &Request<'_>, trust_proxy: bool) -> Self {
        let headers = req.headers();
        Self::from_parts(
            trust_proxy,
            headers.get_one("X-Forwarded-For"),
            headers.get_one("X-Real-IP"),
            req.remote().map(|addr| addr.ip()),
        )
    }

    fn from_parts(
        trust_proxy: bool,
        forwarded_for: Option<&str>,
        real_ip: Option<&str>,
        remote: Option<IpAddr>,
    ) -> Self {
        if trust_proxy {
            // The leftmost entry is the original client.
            let forwarded = forwarded_for
                .and_then(|value| value.split(',').next())
                .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
            let real = real_ip.and_then(|ip| ip.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded.or(real) {
                return Self(ip.to_string());
            }
        }
        match remote {
            Some(ip) => Self(ip.to_string()),
            None => Self("unknown".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A request guard that counts the request against policy `P`.
/// Fails with 429 once the policy's limit is exceeded; take it as
/// `Result<RateLimited<P>, Error>` to get the JSON error body.
pub struct RateLimited<P> {
    pub decision: Decision,
    policy: PhantomData<P>,
}

#[rocket::async_trait]
impl<'r, P> FromRequest<'r> for RateLimited<P>
where
    P: RatePolicy,
{
    type Error = Error;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let rocket = req.rocket();
        let (config, limiter) = match (rocket.state::<Config>(), rocket.state::<RateLimiter>()) {
            (Some(config), Some(limiter)) => (config, limiter),
            _ => {
                let e = Error::Internal("rate limiter is not configured".to_string());
                return Outcome::Error((Status::InternalServerError, e));
            }
        };

        let identity = ClientIdentity::resolve(req, config.trust_proxy());
        let (window, max) = P::limits(config);
        let decision = limiter.allow(P::PREFIX, identity.as_str(), window, max).await;
        req.local_cache(|| Some(decision.clone()));

        if decision.allowed {
            Outcome::Success(Self {
                decision,
                policy: PhantomData,
            })
        } else {
            warn!("Rate limit {} exceeded by {}", P::PREFIX, identity.as_str());
            Outcome::Error((Status::TooManyRequests, Error::RateLimited(decision)))
        }
    }
}

/// A fairing that attaches rate-limit metadata to every gated response,
/// allowed or not.
pub struct RateLimitHeaders;

#[rocket::async_trait]
impl Fairing for RateLimitHeaders {
    fn info(&self) -> Info {
        Info {
            name: "Rate limit headers",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        if let Some(decision) = req.local_cache(|| None::<Decision>) {
            res.set_header(Header::new("X-RateLimit-Limit", decision.limit.to_string()));
            res.set_header(Header::new(
                "X-RateLimit-Remaining",
                decision.remaining.to_string(),
            ));
            res.set_header(Header::new("X-RateLimit-Reset", decision.reset_at.to_string()));
        }
    }
}
